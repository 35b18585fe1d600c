//! Error types for protocol data.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building records or decoding wire data.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A record does not satisfy the add/remove/modify shape rules.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// A wire event or message could not be interpreted.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Creates an invalid record error.
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord(message.into())
    }

    /// Creates a malformed event error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedEvent(message.into())
    }
}
