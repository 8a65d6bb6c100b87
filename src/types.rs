//! Core workflow types
//!
//! Statements come out of the parser, steps are addressed by [`StepId`], and
//! the driver threads a [`Context`] through steps that each return a
//! [`Transition`].

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::fmt;

/// Virtual action that precedes the first step
pub const BEGIN_ACTION: &str = "begin";

/// Terminal marker; reaching it ends a run
pub const END_ACTION: &str = "end";

/// Name of the synthetic step appended after the last statement
pub const COMPLETED_STEP: &str = "_completed";

/* ===================== Statements ===================== */

/// What a single workflow line does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum StatementKind {
    /// Bare line: call the named function
    FunctionCall { function: String },
    /// `wait N`
    Wait { seconds: u64 },
    /// `wait N until F`
    WaitUntil { seconds: u64, condition: String },
    /// `foreach F`
    Loop { function: String },
}

impl StatementKind {
    pub fn is_loop(&self) -> bool {
        matches!(self, StatementKind::Loop { .. })
    }

    pub fn is_call(&self) -> bool {
        matches!(self, StatementKind::FunctionCall { .. })
    }
}

/// One parsed workflow line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    /// Trimmed source text, kept for diagnostics
    pub raw_text: String,
    /// 1-based line number in the source text
    pub line: usize,
    pub kind: StatementKind,
    /// Unique address of this statement's step
    pub step_name: String,
}

impl Statement {
    /// Build a statement; `index` is its position among non-blank lines
    pub fn new(raw_text: impl Into<String>, line: usize, kind: StatementKind, index: usize) -> Self {
        let step_name = step_name(&kind, index);
        Self {
            raw_text: raw_text.into(),
            line,
            kind,
            step_name,
        }
    }
}

fn step_name(kind: &StatementKind, index: usize) -> String {
    match kind {
        StatementKind::FunctionCall { function } => format!("_func_{}_{}", function, index),
        StatementKind::Wait { seconds } => format!("_wait_{}_{}", seconds, index),
        StatementKind::WaitUntil { seconds, condition } => {
            format!("_wait_{}_until_{}_{}", seconds, condition, index)
        }
        StatementKind::Loop { function } => format!("_foreach_{}_{}", function, index),
    }
}

/// Ordered, non-empty list of statements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    statements: Vec<Statement>,
    version: String,
}

impl Program {
    /// Callers guarantee `statements` is non-empty; the parser enforces it.
    pub(crate) fn new(statements: Vec<Statement>) -> Self {
        let version = hash_statements(&statements);
        Self {
            statements,
            version,
        }
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// SHA-256 of the normalized program text
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

fn hash_statements(statements: &[Statement]) -> String {
    let mut hasher = Sha256::new();
    for statement in statements {
        hasher.update(statement.raw_text.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/* ===================== Function Roles ===================== */

/// Signature a function must have, decided by its position in the program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// `f(result) -> result`
    Call,
    /// `f(result) -> (result, keys)`, placed before a `foreach`
    FanOut,
    /// `f(result, values) -> result`, placed after a `foreach`
    Reduce,
    /// `f(result, key) -> value`, the `foreach` function
    Iteration,
    /// `f(result) -> bool`, the `wait N until` function
    Condition,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Call => "call",
            Role::FanOut => "fan-out",
            Role::Reduce => "reduce",
            Role::Iteration => "iteration",
            Role::Condition => "condition",
        };
        f.write_str(name)
    }
}

/* ===================== Actions ===================== */

/// Index of a compiled step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub usize);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where control goes next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Action {
    Step(StepId),
    End,
}

impl Action {
    pub fn is_end(&self) -> bool {
        matches!(self, Action::End)
    }
}

/* ===================== Transitions ===================== */

/// Normal step output: move on to `action`
#[derive(Debug, Clone, PartialEq)]
pub struct Advance {
    pub action: Action,
    pub wait: u64,
    pub result: JsonValue,
    pub iteration_keys: Option<Vec<JsonValue>>,
    pub iteration_values: Option<Vec<JsonValue>>,
    /// Only set by fan-out workers
    pub iteration_value: Option<JsonValue>,
}

impl Advance {
    pub fn new(action: Action, result: JsonValue) -> Self {
        Self {
            action,
            wait: 0,
            result,
            iteration_keys: None,
            iteration_values: None,
            iteration_value: None,
        }
    }
}

/// What a step tells the driver
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Advance(Advance),
    /// Re-invoke the same step after the given delay
    Retry { after_seconds: u64 },
}

/* ===================== Running Context ===================== */

/// The driver's working record
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    pub action: Action,
    pub wait: u64,
    pub result: JsonValue,
    pub iteration_keys: Option<Vec<JsonValue>>,
    pub iteration_values: Option<Vec<JsonValue>>,
    /// Key bound to a single fan-out worker
    pub iteration_key: Option<JsonValue>,
}

impl Context {
    pub fn new(action: Action, result: JsonValue) -> Self {
        Self {
            action,
            wait: 0,
            result,
            iteration_keys: None,
            iteration_values: None,
            iteration_key: None,
        }
    }

    /// Snapshot handed to one fan-out worker
    pub fn for_key(&self, key: JsonValue) -> Self {
        let mut snapshot = self.clone();
        snapshot.iteration_key = Some(key);
        snapshot
    }

    /// Merge a step's output. Fields the transition does not carry keep their
    /// previous value; a retry leaves `action` pointing at the same step.
    pub fn apply(&mut self, transition: Transition) {
        match transition {
            Transition::Advance(advance) => {
                self.action = advance.action;
                self.wait = advance.wait;
                self.result = advance.result;
                if let Some(keys) = advance.iteration_keys {
                    self.iteration_keys = Some(keys);
                }
                if let Some(values) = advance.iteration_values {
                    self.iteration_values = Some(values);
                }
            }
            Transition::Retry { after_seconds } => {
                self.wait = after_seconds;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_names_follow_kind_and_position() {
        let call = Statement::new(
            "step1",
            1,
            StatementKind::FunctionCall {
                function: "step1".into(),
            },
            0,
        );
        assert_eq!(call.step_name, "_func_step1_0");

        let until = Statement::new(
            "wait 3 until ready",
            4,
            StatementKind::WaitUntil {
                seconds: 3,
                condition: "ready".into(),
            },
            2,
        );
        assert_eq!(until.step_name, "_wait_3_until_ready_2");
    }

    #[test]
    fn test_retry_keeps_action() {
        let mut ctx = Context::new(Action::Step(StepId(1)), json!({"n": 1}));
        ctx.apply(Transition::Retry { after_seconds: 5 });

        assert_eq!(ctx.action, Action::Step(StepId(1)));
        assert_eq!(ctx.wait, 5);
        assert_eq!(ctx.result, json!({"n": 1}));
    }

    #[test]
    fn test_advance_keeps_absent_iteration_fields() {
        let mut ctx = Context::new(Action::Step(StepId(0)), json!(null));
        ctx.iteration_keys = Some(vec![json!(1), json!(2)]);

        let mut advance = Advance::new(Action::End, json!(3));
        advance.iteration_values = Some(vec![json!("a")]);
        ctx.apply(Transition::Advance(advance));

        assert_eq!(ctx.action, Action::End);
        assert_eq!(ctx.iteration_keys, Some(vec![json!(1), json!(2)]));
        assert_eq!(ctx.iteration_values, Some(vec![json!("a")]));
        assert_eq!(ctx.wait, 0);
    }
}
