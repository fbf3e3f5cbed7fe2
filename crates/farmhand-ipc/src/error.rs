use std::io::ErrorKind;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode cbor payload: {0}")]
    Encode(String),
    #[error("failed to decode cbor payload: {0}")]
    Decode(String),
    #[error("frame too large: {size} > {max}")]
    FrameTooLarge { size: u32, max: u32 },
}

impl IpcError {
    /// True when the peer is gone: EOF, reset, or a broken pipe.
    ///
    /// The farm treats this as worker death and redistributes the
    /// worker's in-flight calls; every other transport error is logged
    /// without tearing the worker down.
    pub fn is_channel_closed(&self) -> bool {
        match self {
            IpcError::Io(err) => matches!(
                err.kind(),
                ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
