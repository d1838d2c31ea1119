//! Error types and result handling for core storage operations.
//!
//! Repository and migrator failures are classified here so callers can tell
//! a missing row or constraint conflict apart from an unusable database.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and schema operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A schema migration could not be applied.
    ///
    /// The migration transaction has been rolled back and nothing was
    /// recorded, so the migration stays pending.
    #[error("Migration {id} failed: {message}")]
    Migration {
        /// Identifier of the migration that failed.
        id: i64,
        /// Underlying failure.
        message: String,
    },
}

impl CoreError {
    /// Returns true when the error is a unique or duplicate-object conflict.
    ///
    /// Concurrent `CREATE TABLE IF NOT EXISTS` statements can race on the
    /// catalog and surface as a unique violation on `pg_type`.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConstraintViolation(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {}", db_err))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {}", db_err))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {}", db_err))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, CoreError::NotFound(_)));
        assert!(!err.is_conflict());
    }

    #[test]
    fn pool_errors_map_to_database() {
        let err = CoreError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, CoreError::Database(_)));
    }

    #[test]
    fn migration_error_names_the_migration() {
        let err = CoreError::Migration { id: 3, message: "syntax error".to_string() };
        assert_eq!(err.to_string(), "Migration 3 failed: syntax error");
    }
}
