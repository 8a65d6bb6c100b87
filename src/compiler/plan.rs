//! Transition planning
//!
//! Decides, for every statement, its default successor, whether it feeds a
//! `foreach`, and which functions it needs with which signature. Planning
//! only looks at statement kinds and their neighbours; no functions are
//! needed, so the CLI can plan a file on its own.

use crate::errors::CompileError;
use crate::types::{Action, Program, Role, Statement, StatementKind, StepId, COMPLETED_STEP};

/// A function referenced by a step, with the signature its position requires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionUse {
    pub name: String,
    pub role: Role,
}

/// Set on the step right before a `foreach`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOutEntry {
    /// The `foreach` step the keys are meant for
    pub loop_step: StepId,
    /// Where to jump when there are no keys
    pub reduce: Action,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStep {
    pub id: StepId,
    pub name: String,
    /// `None` for the synthetic completion step
    pub statement: Option<Statement>,
    pub next: Action,
    pub fan_out: Option<FanOutEntry>,
    /// Call, fan-out, reduce or iteration function
    pub function: Option<FunctionUse>,
    /// `wait N until F` condition
    pub condition: Option<FunctionUse>,
}

impl PlannedStep {
    pub fn is_loop(&self) -> bool {
        self.statement
            .as_ref()
            .map(|s| s.kind.is_loop())
            .unwrap_or(false)
    }

    /// Delay a `wait N` step emits
    pub fn wait_seconds(&self) -> u64 {
        match self.statement.as_ref().map(|s| &s.kind) {
            Some(StatementKind::Wait { seconds }) => *seconds,
            _ => 0,
        }
    }

    /// Retry interval of a `wait N until F` step
    pub fn retry_seconds(&self) -> Option<u64> {
        match self.statement.as_ref().map(|s| &s.kind) {
            Some(StatementKind::WaitUntil { seconds, .. }) => Some(*seconds),
            _ => None,
        }
    }

    /// Whether fan-out keys come from this step's function or from context
    pub fn produces_keys(&self) -> bool {
        matches!(
            self.function,
            Some(FunctionUse {
                role: Role::FanOut,
                ..
            })
        )
    }
}

/// Explicit step graph for a program; the last step is `_completed`
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub version: String,
    pub steps: Vec<PlannedStep>,
}

impl Plan {
    pub fn entry(&self) -> Action {
        Action::Step(StepId(0))
    }

    /// Every referenced function once, in order of first use
    pub fn required_functions(&self) -> Vec<FunctionUse> {
        let mut seen: Vec<FunctionUse> = Vec::new();
        for step in &self.steps {
            for function in step.function.iter().chain(step.condition.iter()) {
                if !seen.contains(function) {
                    seen.push(function.clone());
                }
            }
        }
        seen
    }

    pub fn action_name(&self, action: Action) -> &str {
        match action {
            Action::End => crate::types::END_ACTION,
            Action::Step(id) => self
                .steps
                .get(id.0)
                .map(|step| step.name.as_str())
                .unwrap_or(crate::types::END_ACTION),
        }
    }
}

/// Build the step graph by walking statements with their neighbours
pub fn plan(program: &Program) -> Result<Plan, CompileError> {
    let statements = program.statements();

    if let Some(first) = statements.first() {
        if !first.kind.is_call() {
            return Err(CompileError::FirstStatementNotCall {
                raw: first.raw_text.clone(),
            });
        }
    }

    let count = statements.len();
    let completed = StepId(count);
    let mut steps = Vec::with_capacity(count + 1);

    for (index, statement) in statements.iter().enumerate() {
        let previous = index.checked_sub(1).map(|i| &statements[i]);
        let successor = statements.get(index + 1);

        let next = match successor {
            Some(_) => Action::Step(StepId(index + 1)),
            None => Action::Step(completed),
        };

        let fan_out = match successor {
            Some(s) if s.kind.is_loop() => Some(FanOutEntry {
                loop_step: StepId(index + 1),
                reduce: if index + 2 < count {
                    Action::Step(StepId(index + 2))
                } else {
                    Action::End
                },
            }),
            _ => None,
        };

        let function = match &statement.kind {
            StatementKind::FunctionCall { function } => {
                let role = if fan_out.is_some() {
                    Role::FanOut
                } else if previous.map(|p| p.kind.is_loop()).unwrap_or(false) {
                    Role::Reduce
                } else {
                    Role::Call
                };
                Some(FunctionUse {
                    name: function.clone(),
                    role,
                })
            }
            StatementKind::Loop { function } => Some(FunctionUse {
                name: function.clone(),
                role: Role::Iteration,
            }),
            StatementKind::Wait { .. } | StatementKind::WaitUntil { .. } => None,
        };

        let condition = match &statement.kind {
            StatementKind::WaitUntil { condition, .. } => Some(FunctionUse {
                name: condition.clone(),
                role: Role::Condition,
            }),
            _ => None,
        };

        steps.push(PlannedStep {
            id: StepId(index),
            name: statement.step_name.clone(),
            statement: Some(statement.clone()),
            next,
            fan_out,
            function,
            condition,
        });
    }

    steps.push(PlannedStep {
        id: completed,
        name: COMPLETED_STEP.to_string(),
        statement: None,
        next: Action::End,
        fan_out: None,
        function: None,
        condition: None,
    });

    Ok(Plan {
        version: program.version().to_string(),
        steps,
    })
}
