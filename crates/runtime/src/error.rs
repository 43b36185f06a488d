//! Error types for the inspector runtime.

use inspector_protocol::CONNECTION_LOST_ERROR_CODE;
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the inspector runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection dropped while requests were still pending.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Error response from the backend.
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    /// A root target was requested without a connection to run it on.
    #[error("no connection available for root target")]
    NoConnection,

    /// Operation on a target that has already been disposed.
    #[error("target disposed: {0}")]
    TargetDisposed(String),

    /// Response channel closed before a reply arrived.
    #[error("channel closed unexpectedly")]
    ChannelClosed,

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for failures caused by the transport going away, whether reported
    /// locally or synthesized by a backend that is known to be unreachable.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Error::ConnectionLost(_) | Error::ChannelClosed => true,
            Error::Remote { code, .. } => *code == CONNECTION_LOST_ERROR_CODE,
            _ => false,
        }
    }
}
