//! Adapter error types.

use thiserror::Error;

/// Errors from debug-session operations.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Console transport failed underneath us.
    #[error("console error: {0}")]
    Console(#[from] glint_console::ConsoleError),

    /// No halt has delivered a callstack yet.
    #[error("no callstack available")]
    NoCallstack,

    /// The variables reference is not (or no longer) known.
    ///
    /// Every halt invalidates the previous halt's references.
    #[error("unknown variables reference {0}")]
    UnknownReference(i64),

    /// The session is not attached to an engine.
    #[error("not attached to an engine")]
    NotAttached,

    /// Launching the engine process failed.
    #[error("launch failed: {0}")]
    Launch(String),

    /// The toolchain configuration could not be read or is invalid.
    #[error("toolchain error: {0}")]
    Toolchain(String),

    /// An engine request timed out or was invalidated by a new halt.
    #[error("engine request failed: {0}")]
    Request(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_unknown_reference_display() {
        let err = AdapterError::UnknownReference(1007);
        assert_eq!(err.to_string(), "unknown variables reference 1007");
    }

    #[test]
    fn error_launch_display() {
        let err = AdapterError::Launch("no port announced within 5s".into());
        assert_eq!(err.to_string(), "launch failed: no port announced within 5s");
    }

    #[test]
    fn error_from_console_error() {
        let err: AdapterError = glint_console::ConsoleError::Closed.into();
        assert!(matches!(err, AdapterError::Console(_)));
        assert!(err.to_string().contains("connection closed"));
    }
}
