//! Shared protocol types and module seams used by all farmhand crates.

pub mod errors;
pub mod ids;
pub mod module;
pub mod protocol;
pub mod value;

pub use errors::{ErrorCode, FarmError};
pub use ids::{HandleId, WorkerId};
pub use module::{MasterBridge, MethodTable, ModuleRegistry, WorkerContext, WorkerModule};
pub use protocol::{
    CallResult, CallTarget, FarmMessage, LogEnvelope, LogLevel, MasterCall, PROTOCOL_VERSION,
    WorkerMessage,
};
pub use value::{CallArg, Handle};
