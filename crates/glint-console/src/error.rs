//! Console protocol error types.

use thiserror::Error;

/// Errors from the engine console transport and connection layer.
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// Socket-level I/O failure.
    #[error("console I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent a frame with a message type we do not understand.
    ///
    /// Fatal to the connection: the stream can no longer be framed.
    #[error("unknown console message type {0}")]
    UnknownMessageType(u32),

    /// A frame carried a header that contradicts itself.
    #[error("malformed console frame: {0}")]
    MalformedFrame(String),

    /// The JSON section of a frame failed to parse.
    #[error("malformed console payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    /// The connection is closed; no further sends are possible.
    #[error("console connection closed")]
    Closed,
}
