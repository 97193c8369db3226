//! Error taxonomy shared by the bridge, the service and the server

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::interpreter::{GuestError, ParseError, Unwind};

/// Fault raised while evaluating guest code, reported to the caller that
/// asked for the evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<GuestError> for EvalError {
    fn from(err: GuestError) -> Self {
        Self::new(err.message)
    }
}

impl From<Unwind> for EvalError {
    fn from(unwind: Unwind) -> Self {
        Self::new(unwind.message())
    }
}

impl From<ParseError> for EvalError {
    fn from(err: ParseError) -> Self {
        Self::new(err.to_string())
    }
}

/// Failure to run a task on the interpreter thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum BridgeError {
    #[error("task was cancelled before it started")]
    Cancelled,

    #[error("interpreter thread has terminated")]
    Terminated,

    #[error("task panicked: {0}")]
    TaskPanicked(String),
}

/// Error returned by `InteropService` operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(untagged)]
pub enum InteropError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Eval(#[from] EvalError),
}

pub type InteropResult<T> = std::result::Result<T, InteropError>;
