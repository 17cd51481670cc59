//! Error types for dltrack core

use thiserror::Error;
use uuid::Uuid;

/// Errors returned by registry commands and storage
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Download coordinator has shut down")]
    Shutdown,
}

impl From<serde_json::Error> for DownloadError {
    fn from(error: serde_json::Error) -> Self {
        DownloadError::Serialization(error.to_string())
    }
}

/// Outcome reported by a transfer delegate when a transfer does not finish
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("Download was cancelled")]
    Cancelled,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error: {status} - {message}")]
    Http { status: u16, message: String },

    #[error("IO error: {0}")]
    Io(String),
}

impl TransferError {
    /// Whether this represents a user-initiated cancellation rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

impl From<std::io::Error> for TransferError {
    fn from(error: std::io::Error) -> Self {
        TransferError::Io(error.to_string())
    }
}

// Allow converting to String for frontends that only carry messages
impl From<DownloadError> for String {
    fn from(error: DownloadError) -> Self {
        error.to_string()
    }
}
