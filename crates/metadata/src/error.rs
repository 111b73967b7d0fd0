//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Config(err.to_string())
    }
}

impl From<depot_core::Error> for MetadataError {
    fn from(err: depot_core::Error) -> Self {
        MetadataError::Internal(err.to_string())
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

/// Map a unique-index violation to [`MetadataError::Constraint`], passing
/// every other database error through.
pub(crate) fn map_unique_violation(err: sqlx::Error, message: &str) -> MetadataError {
    match err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            MetadataError::Constraint(message.to_string())
        }
        other => MetadataError::Database(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transition_message_names_both_states() {
        let err = MetadataError::InvalidStateTransition {
            from: "open".to_string(),
            to: "committed".to_string(),
        };
        assert_eq!(err.to_string(), "invalid state transition: open -> committed");
    }

    #[test]
    fn non_constraint_errors_pass_through() {
        let err = map_unique_violation(sqlx::Error::RowNotFound, "taken");
        assert!(matches!(err, MetadataError::Database(sqlx::Error::RowNotFound)));
    }
}
