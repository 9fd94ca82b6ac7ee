//! Protocol definitions for relay communication
//!
//! Every socket carries length-prefixed JSON frames:
//! `[4-byte length BE][UTF-8 JSON payload]`.

mod message;

pub use message::{
    ErrorBody, InstanceInfo, InstanceStatus, ListInstancesMessage, InstancesMessage, Message,
    Params, PingMessage, RegisterMessage, RegisteredMessage, RequestMessage, ResponseMessage,
    StatusMessage,
};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Version reported by the relay in REGISTERED and first RESPONSE frames
pub const RELAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Length prefix size in bytes
pub const HEADER_SIZE: usize = 4;

/// Maximum payload size (16 MiB)
pub const MAX_PAYLOAD_BYTES: u32 = 16 * 1024 * 1024;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Payload too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: u64, max: u32 },

    #[error("Connection closed before the full frame arrived")]
    ConnectionClosed,

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Prefix a payload with its big-endian length
pub fn frame_message(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut framed = Vec::with_capacity(HEADER_SIZE + payload.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Serialize and frame a message
pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let payload =
        serde_json::to_vec(msg).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if payload.len() as u64 > MAX_PAYLOAD_BYTES as u64 {
        return Err(ProtocolError::MessageTooLarge {
            size: payload.len() as u64,
            max: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(frame_message(&payload))
}

/// Parse a frame payload into a message
pub fn decode(payload: &[u8]) -> Result<Message, ProtocolError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| ProtocolError::Malformed(format!("payload is not UTF-8: {}", e)))?;
    serde_json::from_str(text)
        .map_err(|e| ProtocolError::Malformed(format!("Failed to deserialize: {}", e)))
}

/// Read one frame from a stream
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Option<Message>, ProtocolError> {
    let mut len_bytes = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut len_bytes[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::ConnectionClosed);
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_PAYLOAD_BYTES {
        return Err(ProtocolError::MessageTooLarge {
            size: len as u64,
            max: MAX_PAYLOAD_BYTES,
        });
    }

    let mut buffer = vec![0u8; len as usize];
    match reader.read_exact(&mut buffer).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    }

    decode(&buffer).map(Some)
}

/// Write one frame to a stream
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), ProtocolError> {
    let framed = encode(msg)?;
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}
