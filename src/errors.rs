//! Error taxonomy
//!
//! Parsing, compilation and execution each have their own error enum. All of
//! them are fatal for the program or run they occur in; nothing here is retried.

use crate::types::Role;

/// A workflow line could not be turned into a statement
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid format of line {line} [{raw}]: {reason}")]
    Syntax {
        /// 1-based line number in the source text
        line: usize,
        raw: String,
        reason: String,
    },

    #[error("workflow has no statements")]
    Empty,
}

impl ParseError {
    /// Raw text of the offending line, if the error is tied to one
    pub fn raw_line(&self) -> Option<&str> {
        match self {
            ParseError::Syntax { raw, .. } => Some(raw),
            ParseError::Empty => None,
        }
    }
}

/// A parsed program could not be bound to executable steps
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("first line [{raw}] must be a normal function")]
    FirstStatementNotCall { raw: String },

    #[error("function '{name}' used by step {step} as {role} is not registered")]
    UnknownFunction {
        name: String,
        role: Role,
        step: String,
    },

    #[error("function '{name}' used by step {step} as {expected} is registered as {registered}")]
    SignatureMismatch {
        name: String,
        step: String,
        expected: Role,
        registered: Role,
    },
}

/// A failure while driving compiled steps
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("protocol violation in step {step}: {reason}")]
    ProtocolViolation { step: String, reason: String },

    #[error("action '{0}' does not name any step")]
    UnresolvedAction(String),

    #[error("fan-out workers of step {step} disagree on the next action: '{first}' vs '{other}'")]
    FanOutDisagreement {
        step: String,
        first: String,
        other: String,
    },

    #[error("function '{function}' failed in step {step}")]
    Function {
        step: String,
        function: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("fan-out worker of step {step} did not finish: {message}")]
    WorkerPanicked { step: String, message: String },
}

impl RunError {
    pub(crate) fn protocol(step: &str, reason: impl Into<String>) -> Self {
        RunError::ProtocolViolation {
            step: step.to_string(),
            reason: reason.into(),
        }
    }
}

/// Umbrella error for callers that go end to end
#[derive(Debug, thiserror::Error)]
pub enum FnfigError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("malformed transition record: {0}")]
    Json(#[from] serde_json::Error),
}

pub type FnfigResult<T> = Result<T, FnfigError>;
