//! Step compiler
//!
//! Binds a [`Plan`] to registered functions and produces one executable step
//! per statement plus the synthetic `_completed` step. Each step is a pure
//! function of the running context; all state stays with the caller.

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

pub mod plan;
pub mod registry;


pub use plan::{plan, FanOutEntry, FunctionUse, Plan, PlannedStep};
pub use registry::{FunctionRegistry, UserFunction};

use crate::errors::{CompileError, RunError};
use crate::protocol;
use crate::types::{
    Action, Advance, Context, Program, Statement, StepId, Transition, END_ACTION,
};
use registry::{CallFn, ConditionFn, FanOutFn, IterationFn, ReduceFn};

/// Executable body of a step
pub type StepFn = Arc<dyn Fn(&Context) -> Result<Transition, RunError> + Send + Sync>;

/* ===================== Step Index ===================== */

/// Name <-> id mapping, used at the wire boundary and for override targets
#[derive(Debug, Clone, Default)]
pub struct StepIndex {
    by_name: HashMap<String, StepId>,
    names: Vec<String>,
}

impl StepIndex {
    fn new(plan: &Plan) -> Self {
        let names: Vec<String> = plan.steps.iter().map(|step| step.name.clone()).collect();
        let by_name = plan
            .steps
            .iter()
            .map(|step| (step.name.clone(), step.id))
            .collect();
        Self { by_name, names }
    }

    /// `end` resolves to the terminal action
    pub fn resolve(&self, name: &str) -> Option<Action> {
        if name == END_ACTION {
            return Some(Action::End);
        }
        self.by_name.get(name).copied().map(Action::Step)
    }

    pub fn name(&self, action: Action) -> &str {
        match action {
            Action::End => END_ACTION,
            Action::Step(id) => self.names.get(id.0).map(String::as_str).unwrap_or(END_ACTION),
        }
    }
}

/* ===================== Compiled Program ===================== */

pub struct CompiledStep {
    pub id: StepId,
    pub name: String,
    /// `None` for the synthetic completion step
    pub statement: Option<Statement>,
    pub next: Action,
    body: StepFn,
}

impl CompiledStep {
    pub fn is_loop(&self) -> bool {
        self.statement
            .as_ref()
            .map(|s| s.kind.is_loop())
            .unwrap_or(false)
    }

    pub fn invoke(&self, ctx: &Context) -> Result<Transition, RunError> {
        (self.body)(ctx)
    }

    /// Owned handle on the body, for running it off the driver's task
    pub fn body(&self) -> StepFn {
        Arc::clone(&self.body)
    }
}

impl std::fmt::Debug for CompiledStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledStep")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("next", &self.next)
            .finish()
    }
}

#[derive(Debug)]
pub struct CompiledProgram {
    version: String,
    steps: Vec<CompiledStep>,
    index: Arc<StepIndex>,
}

impl CompiledProgram {
    /// Action the virtual `begin` state transitions to
    pub fn entry(&self) -> Action {
        Action::Step(StepId(0))
    }

    pub fn step(&self, id: StepId) -> Option<&CompiledStep> {
        self.steps.get(id.0)
    }

    pub fn steps(&self) -> &[CompiledStep] {
        &self.steps
    }

    pub fn resolve(&self, name: &str) -> Option<Action> {
        self.index.resolve(name)
    }

    pub fn action_name(&self, action: Action) -> &str {
        self.index.name(action)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    #[cfg(test)]
    pub(crate) fn replace_body(&mut self, id: StepId, body: StepFn) {
        if let Some(step) = self.steps.get_mut(id.0) {
            step.body = body;
        }
    }
}

/* ===================== Compilation ===================== */

/// Plan and bind a parsed program
pub fn compile(program: &Program, registry: &FunctionRegistry) -> Result<CompiledProgram, CompileError> {
    let plan = plan::plan(program)?;
    compile_plan(&plan, registry)
}

/// Bind an existing plan to registered functions
pub fn compile_plan(plan: &Plan, registry: &FunctionRegistry) -> Result<CompiledProgram, CompileError> {
    let index = Arc::new(StepIndex::new(plan));
    let mut steps = Vec::with_capacity(plan.steps.len());

    for planned in &plan.steps {
        let logic = StepLogic::bind(planned, registry, Arc::clone(&index))?;
        let body: StepFn = Arc::new(move |ctx: &Context| logic.run(ctx));

        steps.push(CompiledStep {
            id: planned.id,
            name: planned.name.clone(),
            statement: planned.statement.clone(),
            next: planned.next,
            body,
        });
    }

    tracing::debug!(
        version = %plan.version,
        steps = steps.len(),
        "compiled workflow"
    );

    Ok(CompiledProgram {
        version: plan.version.clone(),
        steps,
        index,
    })
}

/* ===================== Step Logic ===================== */

struct Condition {
    name: String,
    seconds: u64,
    function: ConditionFn,
}

enum KeySource {
    /// The step's own fan-out function produces them
    Function { name: String, function: FanOutFn },
    /// Reuse the keys already in the context
    Context,
}

struct FanOut {
    reduce: Action,
    keys: KeySource,
}

enum Work {
    PassThrough,
    Call { name: String, function: CallFn },
    Reduce { name: String, function: ReduceFn },
    Iterate { name: String, function: IterationFn },
}

struct StepLogic {
    name: String,
    next: Action,
    wait: u64,
    condition: Option<Condition>,
    fan_out: Option<FanOut>,
    work: Work,
    index: Arc<StepIndex>,
}

impl StepLogic {
    fn bind(
        planned: &PlannedStep,
        registry: &FunctionRegistry,
        index: Arc<StepIndex>,
    ) -> Result<Self, CompileError> {
        let condition = match (&planned.condition, planned.retry_seconds()) {
            (Some(use_), Some(seconds)) => match registry.resolve(use_, &planned.name)? {
                UserFunction::Condition(function) => Some(Condition {
                    name: use_.name.clone(),
                    seconds,
                    function,
                }),
                _ => None,
            },
            _ => None,
        };

        let function = match &planned.function {
            Some(use_) => Some((use_.name.clone(), registry.resolve(use_, &planned.name)?)),
            None => None,
        };

        let mut keys = KeySource::Context;
        let work = match function {
            Some((name, UserFunction::FanOut(function))) => {
                keys = KeySource::Function { name, function };
                Work::PassThrough
            }
            Some((name, UserFunction::Call(function))) => Work::Call { name, function },
            Some((name, UserFunction::Reduce(function))) => Work::Reduce { name, function },
            Some((name, UserFunction::Iteration(function))) => Work::Iterate { name, function },
            Some((_, UserFunction::Condition(_))) | None => Work::PassThrough,
        };

        let fan_out = planned.fan_out.map(|entry| FanOut {
            reduce: entry.reduce,
            keys,
        });

        Ok(Self {
            name: planned.name.clone(),
            next: planned.next,
            wait: planned.wait_seconds(),
            condition,
            fan_out,
            work,
            index,
        })
    }

    fn run(&self, ctx: &Context) -> Result<Transition, RunError> {
        if let Some(condition) = &self.condition {
            let ready = (condition.function)(&ctx.result)
                .map_err(|source| self.failed(&condition.name, source))?;
            if !ready {
                tracing::warn!(
                    step = %self.name,
                    after_seconds = condition.seconds,
                    "condition not met, retrying"
                );
                return Ok(Transition::Retry {
                    after_seconds: condition.seconds,
                });
            }
        }

        let mut result = ctx.result.clone();
        let mut advance = Advance::new(self.next, JsonValue::Null);
        advance.wait = self.wait;

        if let Some(fan_out) = &self.fan_out {
            let keys = match &fan_out.keys {
                KeySource::Function { name, function } => {
                    let (carrier, keys) =
                        function(result).map_err(|source| self.failed(name, source))?;
                    result = carrier;
                    keys
                }
                KeySource::Context => ctx.iteration_keys.clone().ok_or_else(|| {
                    RunError::protocol(&self.name, "no iterationKeys in context to fan out over")
                })?,
            };

            if keys.is_empty() {
                tracing::debug!(step = %self.name, "no iteration keys, skipping fan-out");
                let mut skip = Advance::new(fan_out.reduce, result);
                skip.iteration_values = Some(Vec::new());
                return self.normalize(skip);
            }
            advance.iteration_keys = Some(keys);
        }

        match &self.work {
            Work::PassThrough => advance.result = result,
            Work::Call { name, function } => {
                advance.result = function(result).map_err(|source| self.failed(name, source))?;
            }
            Work::Reduce { name, function } => {
                let values = ctx.iteration_values.clone().ok_or_else(|| {
                    RunError::protocol(&self.name, "no iterationValues in context to reduce")
                })?;
                advance.result =
                    function(result, values).map_err(|source| self.failed(name, source))?;
            }
            Work::Iterate { name, function } => {
                let key = ctx.iteration_key.clone().ok_or_else(|| {
                    RunError::protocol(&self.name, "fan-out step invoked without iterationKey")
                })?;
                let value =
                    function(result.clone(), key).map_err(|source| self.failed(name, source))?;
                advance.iteration_value = Some(value);
                advance.result = result;
            }
        }

        self.normalize(advance)
    }

    /// Apply the control-flow override convention to a computed record
    fn normalize(&self, mut advance: Advance) -> Result<Transition, RunError> {
        let (result, target) = protocol::split_override(advance.result, &self.name)?;
        advance.result = result;

        if let Some(target) = target {
            advance.action = self
                .index
                .resolve(&target)
                .ok_or(RunError::UnresolvedAction(target))?;
            tracing::debug!(
                step = %self.name,
                target = %self.index.name(advance.action),
                "control flow redirected"
            );
        }

        Ok(Transition::Advance(advance))
    }

    fn failed(&self, function: &str, source: anyhow::Error) -> RunError {
        RunError::Function {
            step: self.name.clone(),
            function: function.to_string(),
            source,
        }
    }
}
