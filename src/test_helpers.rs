//! Shared fixtures for compiler and simulator tests

use serde_json::Value as JsonValue;

use crate::compiler::{compile, CompiledProgram, FunctionRegistry};
use crate::config::{PauseMode, SimulatorConfig};
use crate::parser::parse_lines;
use crate::simulator::Simulator;

/// Parse and compile, panicking on any error
pub fn compile_lines(lines: &[&str], registry: &FunctionRegistry) -> CompiledProgram {
    let program = parse_lines(lines).expect("Parse workflow failed");
    compile(&program, registry).expect("Compile workflow failed")
}

/// Simulator that honors waits exactly; pair with paused tokio time
pub fn simulator() -> Simulator {
    simulator_with(|_| {})
}

pub fn simulator_with(adjust: impl FnOnce(&mut SimulatorConfig)) -> Simulator {
    let mut config = SimulatorConfig {
        worker_pool_size: 8,
        pause: PauseMode::Honor,
        fixed_pause_ms: 1000,
        fail_fast: true,
    };
    adjust(&mut config);
    Simulator::new(config)
}

/// Numeric view of a JSON value, for arithmetic in test functions
pub fn num(value: &JsonValue) -> i64 {
    value.as_i64().unwrap_or_default()
}
