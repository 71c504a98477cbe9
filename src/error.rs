//! Error types for fcgi-backend.

use thiserror::Error;

/// Main error type for all FastCGI operations.
#[derive(Debug, Error)]
pub enum FcgiError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error (control plane only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed or out-of-spec wire data (bad header, truncated pairs,
    /// invalid enum value, wrong direction, wrong request id).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The connection has already been closed.
    #[error("FastCGI connection is closed")]
    ConnectionClosed,

    /// A listen address that could not be parsed.
    #[error("Invalid listen address: {0}")]
    InvalidAddress(String),

    /// Non-empty data written to an output stream after its EOF marker.
    #[error("{0} already closed")]
    StreamClosed(&'static str),
}

impl FcgiError {
    /// Shorthand for building a [`FcgiError::Protocol`].
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        FcgiError::Protocol(msg.into())
    }

    /// Whether this error is a protocol violation.
    pub fn is_protocol(&self) -> bool {
        matches!(self, FcgiError::Protocol(_))
    }
}

/// Result type alias using FcgiError.
pub type Result<T> = std::result::Result<T, FcgiError>;
