//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// A staged part does not hold the bytes its range claims.
    #[error("staged part at offset {offset} has {actual} bytes, expected {expected}")]
    PartMismatch {
        offset: u64,
        expected: u64,
        actual: u64,
    },

    /// The incoming byte stream failed before it was fully written.
    #[error("request body error: {0}")]
    Body(String),

    #[error("body exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("body has {actual} bytes, expected {expected}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Whether the failure was caused by the caller's data rather than the backend.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Body(_)
                | Self::TooLarge { .. }
                | Self::LengthMismatch { .. }
                | Self::InvalidRange(_)
        )
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
