pub mod cli;
pub mod compiler;
pub mod config;
pub mod errors;
pub mod parser;
pub mod protocol;
pub mod simulator;
pub mod types;

#[cfg(test)]
mod test_helpers;

// Re-export main types
pub use types::*;

pub use compiler::{compile, CompiledProgram, FunctionRegistry};
pub use errors::{FnfigError, FnfigResult};
pub use protocol::{go_to, go_to_end, Handler, TransitionRecord};
pub use simulator::{RunReport, Simulator};

/// Parse and compile workflow source in one go
pub fn compile_source(source: &str, registry: &FunctionRegistry) -> FnfigResult<CompiledProgram> {
    let program = parser::parse_program(source)?;
    Ok(compile(&program, registry)?)
}
