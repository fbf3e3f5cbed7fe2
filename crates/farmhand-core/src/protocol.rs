use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{FarmError, ids::HandleId, value::CallArg};

pub const PROTOCOL_VERSION: u32 = 1;

/// Outcome of one call, in wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "content_type", content = "content", rename_all = "snake_case")]
pub enum CallResult {
    Data(Value),
    Error(FarmError),
}

impl From<Result<Value, FarmError>> for CallResult {
    fn from(outcome: Result<Value, FarmError>) -> Self {
        match outcome {
            Ok(value) => CallResult::Data(value),
            Err(err) => CallResult::Error(err),
        }
    }
}

impl From<CallResult> for Result<Value, FarmError> {
    fn from(result: CallResult) -> Self {
        match result {
            CallResult::Data(value) => Ok(value),
            CallResult::Error(err) => Err(err),
        }
    }
}

/// Target of a child-to-parent request. Exactly one identifies the callee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum CallTarget {
    /// A parent-side reverse handle.
    Handle { id: HandleId },
    /// A module id in the parent's registry.
    Location { path: String },
}

/// A request sent from a child back into the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterCall {
    /// Correlation id for the reply; assigned by the sender when a
    /// response is awaited.
    pub idx: Option<u64>,
    #[serde(flatten)]
    pub target: CallTarget,
    /// Named method on the target; `None` invokes the target itself.
    pub method: Option<String>,
    pub args: Vec<CallArg>,
    pub await_response: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Progress,
    Verbose,
    Warn,
    Error,
}

/// A log event forwarded from a worker to the parent logger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEnvelope {
    pub level: LogLevel,
    pub message: String,
}

/// Messages flowing parent -> child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FarmMessage {
    /// A dispatched call.
    Call {
        idx: u64,
        method: String,
        args: Vec<CallArg>,
    },
    /// Reply to a child's awaited request.
    Response { idx: u64, result: CallResult },
    /// Graceful shutdown request.
    End {},
}

/// Messages flowing child -> parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Readiness signal, sent once after startup.
    Ready { protocol: u32, pid: u32 },
    /// Completion of a dispatched call.
    Response { idx: u64, result: CallResult },
    /// Reverse or master call into the parent.
    Request(MasterCall),
    /// Forwarded log event.
    Log(LogEnvelope),
}
