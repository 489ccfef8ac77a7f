//! Error types for mise.

use thiserror::Error;

/// Result type alias using mise's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for mise operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Job input failed a precondition check
    #[error("Validation error: {0}")]
    Validation(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Note not found
    #[error("Note not found: {0}")]
    NoteNotFound(String),

    /// Persistence write or read failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Status broadcast could not be delivered
    #[error("Broadcast error: {0}")]
    Broadcast(String),

    /// File or image storage failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Job queue error
    #[error("Job error: {0}")]
    Job(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a job failing with this error may succeed on a later attempt.
    ///
    /// Bad input stays bad, so validation, serialization and configuration
    /// errors are permanent.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Validation(_) | Error::Serialization(_) | Error::Config(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
