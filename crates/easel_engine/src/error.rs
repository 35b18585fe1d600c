//! Error types for the history manager and sync session.

use easel_protocol::ProtocolError;
use thiserror::Error;

/// Result type for plugin apply operations.
pub type ApplyResult<T> = Result<T, ApplyError>;

/// Result type for history operations.
pub type HistoryResult<T> = Result<T, HistoryError>;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors raised by a plugin while applying a record.
#[derive(Error, Debug)]
pub enum ApplyError {
    /// The object to restore does not exist.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// The record lacks the snapshots this direction needs.
    #[error("record {record_id} has no {side} snapshots")]
    MissingSnapshots {
        /// Record ID.
        record_id: String,
        /// `before` or `after`.
        side: &'static str,
    },

    /// Plugin-specific failure.
    #[error("{0}")]
    Plugin(String),
}

impl ApplyError {
    /// Creates a plugin-specific failure.
    pub fn plugin(message: impl Into<String>) -> Self {
        Self::Plugin(message.into())
    }
}

/// Errors raised by the history manager.
#[derive(Error, Debug)]
pub enum HistoryError {
    /// A plugin failed while a record was replayed.
    #[error("plugin `{owner}` failed to apply record {record_id}: {source}")]
    Apply {
        /// Owning plugin.
        owner: String,
        /// Record being applied.
        record_id: String,
        /// Underlying failure.
        #[source]
        source: ApplyError,
    },

    /// A record failed validation.
    #[error("invalid record: {0}")]
    InvalidRecord(#[from] ProtocolError),
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Protocol error (invalid message format).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server rejected the request.
    #[error("server error: {0}")]
    ServerError(String),

    /// Applying a remote event failed.
    #[error("history error: {0}")]
    History(#[from] HistoryError),

    /// A plugin or injection handler failed outside of history replay.
    #[error("apply error: {0}")]
    Apply(#[from] ApplyError),

    /// Invalid session state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,

    /// The session was destroyed.
    #[error("session closed")]
    Closed,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::ServerError(_) => true,
            _ => false,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("bad request").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::ServerError("internal error".into()).is_retryable());
        assert!(!SyncError::Closed.is_retryable());
        assert!(!SyncError::Protocol("bad frame".into()).is_retryable());
    }

    #[test]
    fn error_display() {
        assert_eq!(SyncError::NotConnected.to_string(), "not connected to server");

        let err = HistoryError::Apply {
            owner: "image".into(),
            record_id: "1-1".into(),
            source: ApplyError::ObjectNotFound("o1".into()),
        };
        let text = err.to_string();
        assert!(text.contains("image"));
        assert!(text.contains("o1"));
    }

    #[test]
    fn protocol_errors_convert() {
        let err: SyncError = ProtocolError::malformed("no id").into();
        assert!(matches!(err, SyncError::Protocol(ref m) if m.contains("no id")));

        let err: HistoryError = ProtocolError::invalid_record("empty owner").into();
        assert!(matches!(err, HistoryError::InvalidRecord(_)));
    }
}
