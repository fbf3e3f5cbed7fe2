use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{FarmError, ids::HandleId};

/// Opaque reference to a parent-side function, passable into workers.
///
/// On the wire a handle is nothing but its id; the parent-side registry
/// resolves it back to the stored function when it returns in a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    pub id: HandleId,
}

/// One argument of a worker call.
///
/// Plain values travel as [`serde_json::Value`]; handles travel as their
/// own variant so they survive the round-trip to a child and back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallArg {
    Data { value: Value },
    Handle { id: HandleId },
}

impl CallArg {
    pub fn data(value: impl Into<Value>) -> Self {
        CallArg::Data {
            value: value.into(),
        }
    }

    pub fn handle(handle: Handle) -> Self {
        CallArg::Handle { id: handle.id }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            CallArg::Data { value } => Some(value),
            CallArg::Handle { .. } => None,
        }
    }

    pub fn as_handle(&self) -> Option<Handle> {
        match self {
            CallArg::Handle { id } => Some(Handle { id: *id }),
            CallArg::Data { .. } => None,
        }
    }

    /// Extracts a plain value, failing on a handle argument.
    pub fn into_value(self) -> Result<Value, FarmError> {
        match self {
            CallArg::Data { value } => Ok(value),
            CallArg::Handle { id } => Err(FarmError::invalid_request(
                "expected a plain value argument",
            )
            .with_detail(format!("got handle {}", id.0))),
        }
    }
}

impl From<Handle> for CallArg {
    fn from(handle: Handle) -> Self {
        CallArg::handle(handle)
    }
}
