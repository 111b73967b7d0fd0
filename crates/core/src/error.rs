//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid block id: {0}")]
    InvalidBlockId(String),

    #[error("invalid byte range: {0}")]
    InvalidRange(String),

    #[error("invalid size: {0}")]
    InvalidSize(String),

    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("invalid upload id: {0}")]
    InvalidUploadId(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
