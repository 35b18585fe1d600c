//! CLI error types.

use easel_engine::{HistoryError, SyncError};
use easel_server::HubError;
use thiserror::Error;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid command-line arguments.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// File access failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A file did not contain the expected JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A session operation failed.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// A history operation failed.
    #[error("history error: {0}")]
    History(#[from] HistoryError),

    /// The hub rejected a request.
    #[error("hub error: {0}")]
    Hub(#[from] HubError),

    /// Simulated clients ended with different documents.
    #[error("documents diverged: {client} differs from {reference}")]
    Diverged {
        /// Client used as the reference.
        reference: String,
        /// First client whose document differs.
        client: String,
    },
}
