//! Error types for tidesync

use thiserror::Error;

use crate::types::EntityId;

/// Result type alias for tidesync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for tidesync
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Remote server fault ({status}): {message}")]
    ServerFault { status: u16, message: String },

    #[error("Entity not found: {0}")]
    NotFound(EntityId),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Sync already in progress")]
    SyncInProgress,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Check if error is retryable at the transport layer
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::Timeout(_) | SyncError::ServerFault { .. }
        )
    }

    /// HTTP status carried by a remote answer, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Rejected { status, .. } | SyncError::ServerFault { status, .. } => {
                Some(*status)
            }
            SyncError::NotFound(_) => Some(404),
            _ => None,
        }
    }

    /// Build the error for a non-success HTTP status
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status >= 500 {
            SyncError::ServerFault { status, message }
        } else {
            SyncError::Rejected { status, message }
        }
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            SyncError::from_status(status.as_u16(), e.to_string())
        } else if e.is_timeout() {
            SyncError::Timeout(0)
        } else if e.is_decode() {
            SyncError::Internal(format!("Failed to decode response: {}", e))
        } else {
            SyncError::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_taxonomy() {
        assert!(SyncError::Transport("unreachable".into()).is_retryable());
        assert!(SyncError::Timeout(10_000).is_retryable());
        assert!(SyncError::from_status(503, "unavailable").is_retryable());

        assert!(!SyncError::from_status(400, "bad request").is_retryable());
        assert!(!SyncError::NotFound(7).is_retryable());
        assert!(!SyncError::SyncInProgress.is_retryable());
    }

    #[test]
    fn test_from_status_splits_client_and_server() {
        assert!(matches!(
            SyncError::from_status(422, "nope"),
            SyncError::Rejected { status: 422, .. }
        ));
        assert!(matches!(
            SyncError::from_status(500, "boom"),
            SyncError::ServerFault { status: 500, .. }
        ));
        assert_eq!(SyncError::NotFound(3).status(), Some(404));
    }
}
