use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::IpcError;

/// Frame payload cap used when the embedder does not configure one.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Serializes a value to CBOR bytes for wire transmission.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, IpcError> {
    serde_cbor::to_vec(value).map_err(|err| IpcError::Encode(err.to_string()))
}

/// Deserializes a CBOR frame payload into a typed value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, IpcError> {
    serde_cbor::from_slice(bytes).map_err(|err| IpcError::Decode(err.to_string()))
}

/// Passes a value through the wire encoding and back.
///
/// The in-parent call path runs arguments through this so local and
/// remote invocations observe identical value semantics: both receive a
/// fresh deep copy with whatever the codec preserves, nothing more.
pub fn roundtrip<T>(value: &T) -> Result<T, IpcError>
where
    T: Serialize + DeserializeOwned,
{
    decode(&encode(value)?)
}

/// Length-prefixed CBOR framing over any async stream.
///
/// The payload cap is farm configuration, not a transport constant: both
/// halves of a worker connection must agree on it, so the parent hands
/// its value to the child at spawn.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Writes one length-prefixed frame to the async writer.
    pub async fn write_frame<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        payload: &[u8],
    ) -> Result<(), IpcError> {
        let size: u32 = payload
            .len()
            .try_into()
            .map_err(|_| IpcError::FrameTooLarge {
                size: u32::MAX,
                max: self.max_frame_size,
            })?;

        if size > self.max_frame_size {
            return Err(IpcError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }

        writer.write_all(&size.to_be_bytes()).await?;
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads one length-prefixed frame from the async reader.
    pub async fn read_frame<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
    ) -> Result<Vec<u8>, IpcError> {
        let mut header = [0_u8; 4];
        reader.read_exact(&mut header).await?;

        let size = u32::from_be_bytes(header);
        if size > self.max_frame_size {
            return Err(IpcError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }

        let mut payload = vec![0_u8; size as usize];
        reader.read_exact(&mut payload).await?;
        Ok(payload)
    }

    /// Encodes one message and writes it as a single frame.
    pub async fn write_message<W, T>(&self, writer: &mut W, value: &T) -> Result<(), IpcError>
    where
        W: AsyncWrite + Unpin,
        T: Serialize,
    {
        let payload = encode(value)?;
        self.write_frame(writer, &payload).await
    }

    /// Reads one frame and decodes it into a typed message.
    pub async fn read_message<R, T>(&self, reader: &mut R) -> Result<T, IpcError>
    where
        R: AsyncRead + Unpin,
        T: DeserializeOwned,
    {
        let frame = self.read_frame(reader).await?;
        decode(&frame)
    }
}
