/// Error types for the message sync core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Backend error ({status}): {message}")]
    Backend { status: u16, message: String },

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Push channel error: {0}")]
    Push(String),

    #[error("Polling is shutting down, retry shortly")]
    ShuttingDown,
}

impl SyncError {
    /// Transport-level failures expected to clear on their own.
    ///
    /// The poll loop backs off on every error; this only decides whether a
    /// failure is logged as a hiccup or as a rejection.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Io(_)
                | SyncError::Http(_)
                | SyncError::Timeout(_)
                | SyncError::Backend {
                    status: 408 | 429 | 500..=599,
                    ..
                }
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
