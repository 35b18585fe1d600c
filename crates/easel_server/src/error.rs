//! Error types for the sync hub.

use easel_protocol::ProtocolError;
use thiserror::Error;

/// Result type for hub operations.
pub type HubResult<T> = Result<T, HubError>;

/// Errors that can occur in the sync hub.
#[derive(Error, Debug)]
pub enum HubError {
    /// Invalid request format or content.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown endpoint.
    #[error("not found: {0}")]
    NotFound(String),

    /// A full upload was based on an outdated sequence.
    #[error("stale upload: based on sequence {base}, hub is at {current}")]
    StaleUpload {
        /// Sequence the client uploaded from.
        base: u64,
        /// Current hub sequence.
        current: u64,
    },

    /// Encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// Internal hub error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            HubError::InvalidRequest(_) | HubError::NotFound(_) | HubError::StaleUpload { .. }
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Returns the matching HTTP status code.
    pub fn status_code(&self) -> u16 {
        match self {
            HubError::InvalidRequest(_) => 400,
            HubError::NotFound(_) => 404,
            HubError::StaleUpload { .. } => 409,
            HubError::Codec(_) | HubError::Internal(_) => 500,
        }
    }
}
