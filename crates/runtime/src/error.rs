//! Error types for the MDB runtime.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the MDB runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// The mdb binary was not found.
    #[error("mdb not found. Install mdb or set MDB_EXE to the binary path")]
    DebuggerNotFound,

    /// The debugger extension module (dmod) was not found on disk.
    #[error("debugger extension module not found at {0}")]
    ExtensionNotFound(PathBuf),

    /// Failed to launch the debugger process.
    #[error("failed to launch mdb: {0}")]
    LaunchFailed(String),

    /// Session setup commands failed, or the debugger emitted stderr
    /// output before setup completed.
    #[error("session setup failed: {0}")]
    SetupFailed(String),

    /// Caller misuse of the session protocol. Never retried and never
    /// swallowed: a pending command means the caller forgot to await the
    /// previous one.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The debugger exited while a command was in flight.
    #[error("mdb exited unexpectedly{}", .code.map(|c| format!(" with code {c}")).unwrap_or_default())]
    SessionTerminated { code: Option<i32> },

    /// A command was submitted after the session reached a terminal state.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// Transport-level error (stdio framing).
    #[error("transport error: {0}")]
    TransportError(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel closed unexpectedly.
    #[error("channel closed unexpectedly")]
    ChannelClosed,
}

impl Error {
    /// Returns true if this is a caller programming error.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::ProtocolViolation(_))
    }

    /// Returns true if the debugger process went away underneath us.
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            Error::SessionTerminated { .. } | Error::SessionClosed(_)
        )
    }
}
