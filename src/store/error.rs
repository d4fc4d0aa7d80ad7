//! Error types for the SQL backends.
//!
//! Every backend maps its native failure into [`StoreError`]. A violated
//! uniqueness constraint is always surfaced as
//! [`UniqueViolation`](StoreError::UniqueViolation) so callers can tell a
//! replayed transaction id from an infrastructure failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A UNIQUE constraint rejected the write.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    /// The local database driver failed.
    #[error("database error: {0}")]
    Database(String),

    /// The remote SQL endpoint answered with an error.
    #[error("remote store error (status {status}): {message}")]
    Remote { status: u16, message: String },

    #[error("remote store unreachable: {0}")]
    Http(#[from] reqwest::Error),

    /// A row did not have the shape the caller expected.
    #[error("failed to decode row: {0}")]
    Decode(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::UniqueViolation(db.message().to_string())
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}
