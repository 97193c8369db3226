//! Wire format of the stdio server: one JSON object per line

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{BridgeError, InteropError};
use crate::events::AsyncEvent;
use crate::interpreter::SourcePosition;
use crate::refs::{Handle, Reference};

pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const EVAL_ERROR: i32 = -32000;
pub const TERMINATED: i32 = -32001;
pub const TASK_PANICKED: i32 = -32002;
pub const REQUEST_CANCELLED: i32 = -32800;

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_params(err: serde_json::Error) -> Self {
        Self::new(INVALID_PARAMS, format!("invalid params: {}", err))
    }
}

impl From<InteropError> for ErrorBody {
    fn from(err: InteropError) -> Self {
        let code = match &err {
            InteropError::Eval(_) => EVAL_ERROR,
            InteropError::Bridge(BridgeError::Cancelled) => REQUEST_CANCELLED,
            InteropError::Bridge(BridgeError::Terminated) => TERMINATED,
            InteropError::Bridge(BridgeError::TaskPanicked(_)) => TASK_PANICKED,
        };
        Self::new(code, err.to_string())
    }
}

/// A line written to the client
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outgoing {
    Response {
        id: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    Event {
        event: AsyncEvent,
    },
}

impl Outgoing {
    pub fn reply(id: Value, outcome: Result<Value, ErrorBody>) -> Self {
        match outcome {
            Ok(result) => Outgoing::Response {
                id,
                result: Some(result),
                error: None,
            },
            Err(error) => Outgoing::Response {
                id,
                result: None,
                error: Some(error),
            },
        }
    }
}

/* ===================== Parameters ===================== */

#[derive(Debug, Deserialize)]
pub struct ReferenceParams {
    pub reference: Reference,
}

#[derive(Debug, Deserialize)]
pub struct VariablesParams {
    pub reference: Reference,
    #[serde(default)]
    pub start: usize,
    /// Exclusive; all remaining children when absent
    #[serde(default)]
    pub end: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SetValueParams {
    pub target: Reference,
    pub source: Reference,
}

#[derive(Debug, Deserialize)]
pub struct CodeParams {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct ReplExecuteParams {
    pub code: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default = "default_debug")]
    pub debug: bool,
}

fn default_debug() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct LineParams {
    pub line: String,
}

#[derive(Debug, Deserialize)]
pub struct HandleParams {
    pub handle: Handle,
}

#[derive(Debug, Deserialize)]
pub struct HandlesParams {
    pub handles: Vec<Handle>,
}

#[derive(Debug, Deserialize)]
pub struct PositionParams {
    pub position: SourcePosition,
}

#[derive(Debug, Deserialize)]
pub struct MuteParams {
    pub muted: bool,
}

#[derive(Debug, Deserialize)]
pub struct CancelParams {
    pub id: Value,
}

#[derive(Debug, Deserialize)]
pub struct RequestFinishedParams {
    pub request_id: u64,
}
