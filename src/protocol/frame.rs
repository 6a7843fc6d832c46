//! Low-level wire framing
//!
//! Every message on a socket, client-facing or peer-facing, is
//!
//! ```text
//! +--------------------------+---------------------+
//! | 4 bytes                  | N bytes             |
//! | payload length (BE u32)  | UTF-8 JSON payload  |
//! +--------------------------+---------------------+
//! ```
//!
//! A short read at any point means the peer went away mid-frame; the
//! frame is unusable and the connection is closed without a reply.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{KvError, Result};

/// Upper bound on a single frame. A corrupt length prefix becomes a
/// closed connection instead of a multi-gigabyte allocation.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed the connection, whether at a
/// clean frame boundary or mid-frame; the caller closes silently either
/// way.
pub async fn read_frame<S>(stream: &mut S) -> Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(KvError::Protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_LEN
        )));
    }

    let mut payload = vec![0u8; len];
    match stream.read_exact(&mut payload).await {
        Ok(_) => Ok(Some(payload)),
        Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write one length-prefixed frame and flush it.
pub async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = payload.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Serialize `body` and send it as one frame.
pub async fn write_json<S>(stream: &mut S, body: &serde_json::Value) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(body)?;
    write_frame(stream, &payload).await
}

/// Read one frame and parse it as JSON.
///
/// `Ok(None)` means the connection closed; a frame that is not valid
/// JSON is a protocol error (the connection itself is still usable).
pub async fn read_json<S>(stream: &mut S) -> Result<Option<serde_json::Value>>
where
    S: AsyncRead + Unpin,
{
    match read_frame(stream).await? {
        Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
        None => Ok(None),
    }
}
