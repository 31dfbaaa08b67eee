//! DAP transport layer — Content-Length based message framing over
//! stdio.

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Errors on the front-end wire.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode a JSON value into a DAP wire-format message with
/// Content-Length header.
pub fn encode_message(value: &serde_json::Value) -> Vec<u8> {
    let body = serde_json::to_string(value).unwrap_or_default();
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut buf = Vec::with_capacity(header.len() + body.len());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(body.as_bytes());
    buf
}

/// Read one DAP message from `reader`.
///
/// Returns `Ok(None)` on clean end of stream before any header byte.
pub async fn read_message<R>(
    reader: &mut BufReader<R>,
) -> Result<Option<serde_json::Value>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return if content_length.is_none() {
                Ok(None)
            } else {
                Err(TransportError::Transport("stream ended mid-header".into()))
            };
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some(value) = trimmed.strip_prefix("Content-Length:") {
            let value = value.trim();
            content_length = Some(value.parse::<usize>().map_err(|e| {
                TransportError::Transport(format!("invalid Content-Length value '{value}': {e}"))
            })?);
        }
        // Other header fields are permitted and ignored.
    }

    let length = content_length
        .ok_or_else(|| TransportError::Transport("missing Content-Length header".into()))?;
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}
