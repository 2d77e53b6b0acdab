//! Wire framing for payloads.
//!
//! ```text
//! +----------------------+
//! | body length (u32 BE) |
//! +----------------------+
//! | magic "DTRP"         |
//! | version (u16 BE)     |
//! | Payload (bincode)    |
//! +----------------------+
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::payload::Payload;
use crate::error::{Result, RuntimeError};

/// Magic bytes opening every frame body.
pub const MAGIC: [u8; 4] = *b"DTRP";

/// Protocol version. Peers reject frames carrying any other version.
pub const PROTOCOL_VERSION: u16 = 1;

const HEADER_LEN: usize = MAGIC.len() + std::mem::size_of::<u16>();

/// Encode `payload` into a length-prefixed frame.
pub fn encode_frame(payload: &Payload, max_frame_bytes: usize) -> Result<Vec<u8>> {
    let encoded = bincode::serialize(payload).map_err(|e| {
        RuntimeError::transport_with_source("failed to encode payload", e)
    })?;

    let body_len = HEADER_LEN + encoded.len();
    let prefix = match u32::try_from(body_len) {
        Ok(prefix) if body_len <= max_frame_bytes => prefix,
        _ => {
            return Err(RuntimeError::transport(format!(
                "frame of {} bytes exceeds limit {}",
                body_len,
                max_frame_bytes.min(u32::MAX as usize)
            )))
        }
    };

    let mut frame = Vec::with_capacity(4 + body_len);
    frame.extend_from_slice(&prefix.to_be_bytes());
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    frame.extend_from_slice(&encoded);
    Ok(frame)
}

/// Decode a frame body (without the length prefix).
pub fn decode_body(body: &[u8]) -> Result<Payload> {
    if body.len() < HEADER_LEN {
        return Err(RuntimeError::transport(format!(
            "frame body of {} bytes is shorter than the header",
            body.len()
        )));
    }
    if body[..4] != MAGIC {
        return Err(RuntimeError::transport("frame has invalid magic bytes"));
    }
    let version = u16::from_be_bytes([body[4], body[5]]);
    if version != PROTOCOL_VERSION {
        return Err(RuntimeError::transport(format!(
            "unsupported protocol version {} (expected {})",
            version, PROTOCOL_VERSION
        )));
    }

    bincode::deserialize(&body[HEADER_LEN..])
        .map_err(|e| RuntimeError::transport_with_source("failed to decode payload", e))
}

/// Read one frame. Returns `Ok(None)` when the peer closed the stream on a
/// frame boundary.
pub async fn read_frame<R>(io: &mut R, max_frame_bytes: usize) -> Result<Option<Payload>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match io.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(RuntimeError::transport_with_source("failed to read frame length", e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_bytes {
        return Err(RuntimeError::transport(format!(
            "incoming frame of {} bytes exceeds limit {}",
            len, max_frame_bytes
        )));
    }

    let mut body = vec![0u8; len];
    io.read_exact(&mut body)
        .await
        .map_err(|e| RuntimeError::transport_with_source("failed to read frame body", e))?;

    decode_body(&body).map(Some)
}

/// Write one pre-encoded frame.
pub async fn write_frame<W>(io: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    io.write_all(frame)
        .await
        .map_err(|e| RuntimeError::transport_with_source("failed to write frame", e))?;
    io.flush()
        .await
        .map_err(|e| RuntimeError::transport_with_source("failed to flush frame", e))
}
