//! glint-console — client for the Glint engine's embedded console server.
//!
//! Implements the binary length-framed JSON wire format, the connection
//! lifecycle with ordered event delivery, and the one-shot reply
//! registry used to correlate asynchronous engine replies.

pub mod connection;
pub mod correlate;
pub mod error;
pub mod frame;

// Re-export key types for convenience.
pub use connection::{
    Connection, ConnectionState, ConsoleEvent, COMPILER_PORT, DEFAULT_IP, GAME_PORT_BASE,
};
pub use correlate::Correlator;
pub use error::ConsoleError;
pub use frame::{ConsoleMessage, FrameDecoder, MessageType};
