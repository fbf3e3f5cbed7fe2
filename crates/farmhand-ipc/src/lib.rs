//! Async CBOR-over-stream transport used between the farm and its workers.

mod error;

pub mod codec;

pub use codec::{DEFAULT_MAX_FRAME_SIZE, FrameCodec, decode, encode, roundtrip};
pub use error::IpcError;
