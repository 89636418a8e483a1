// src/dap/framing.rs

//! `Content-Length` message framing.
//!
//! Each message is `Content-Length: N\r\n\r\n` followed by exactly `N` bytes
//! of JSON. The same framing is used towards the debugger adapter (stdio) and
//! towards clients (TCP).

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{RelayError, Result};

/// Upper bound on a single frame; anything larger is treated as corruption.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Read one framed JSON message.
///
/// Returns `Ok(None)` on a clean end of stream before any header byte.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Value>>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        let read_n = reader.read_line(&mut line).await?;
        if read_n == 0 {
            if saw_header {
                return Err(RelayError::Other(anyhow::anyhow!(
                    "stream closed inside frame header"
                )));
            }
            return Ok(None);
        }
        saw_header = true;

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if content_length.is_some() {
                break;
            }
            // Tolerate stray blank lines between frames.
            saw_header = false;
            continue;
        }
        if let Some(v) = line.strip_prefix("Content-Length:") {
            let len: usize = v.trim().parse().map_err(|_| {
                RelayError::Other(anyhow::anyhow!("invalid Content-Length header: {line:?}"))
            })?;
            content_length = Some(len);
        }
    }

    let len = content_length.unwrap_or_default();
    if len > MAX_FRAME_BYTES {
        return Err(RelayError::Other(anyhow::anyhow!(
            "frame of {len} bytes exceeds limit"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(serde_json::from_slice(&buf)?))
}

/// Write one framed JSON message and flush.
pub async fn write_message<W>(writer: &mut W, message: &Value) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(message)?;
    let header = format!("Content-Length: {}\r\n\r\n", payload.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}
