//! Unified error type for store operations.
//!
//! Engine code branches on this closed set of kinds; it never inspects
//! driver-specific error codes or message strings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Entity not found by the given identifier.
    #[error("entity not found")]
    NotFound,

    /// Unique constraint violation, e.g. a duplicate
    /// `(phone_number, category_id)` pair.
    #[error("unique constraint violation: {message}")]
    UniqueViolation {
        constraint: Option<String>,
        message: String,
    },

    /// Foreign key constraint violation, e.g. deleting a category that still
    /// has contacts.
    #[error("foreign key constraint violation: {message}")]
    ForeignKeyViolation {
        constraint: Option<String>,
        message: String,
    },

    /// A write was refused because the message record is already in a
    /// terminal status. Benign for callback reconciliation.
    #[error("message record is already in a terminal status")]
    TerminalStatus,

    /// Catch-all for non-recoverable errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    StoreError::UniqueViolation {
                        constraint: db_err.constraint().map(|s| s.to_string()),
                        message: db_err.message().to_string(),
                    }
                } else if db_err.is_foreign_key_violation() {
                    StoreError::ForeignKeyViolation {
                        constraint: db_err.constraint().map(|s| s.to_string()),
                        message: db_err.message().to_string(),
                    }
                } else {
                    StoreError::Other(err.into())
                }
            }
            _ => StoreError::Other(err.into()),
        }
    }
}
