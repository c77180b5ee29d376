//! Error type for blog operations.

use rusqlite::ErrorCode;
use scribe_bus::PublishError;
use scribe_outbox::OutboxError;
use thiserror::Error;

/// Errors that can occur during blog operations.
#[derive(Debug, Error)]
pub enum BlogError {
    /// The post or user does not exist, is deleted, or is not owned by the
    /// caller.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller may see the resource but not change it.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// An update request carried no fields.
    #[error("no fields to update")]
    NoFieldsToUpdate,

    /// Input failed validation.
    #[error("invalid input: {0}")]
    Validation(String),

    /// A uniqueness rule was violated (e.g. username taken).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Recording the domain event in the outbox failed; the business write
    /// was rolled back with it.
    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),

    /// Direct publish failed after the business write had committed.
    #[error("publish failed after commit: {0}")]
    Publish(#[from] PublishError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Connection pool exhaustion or a failed blocking task.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<r2d2::Error> for BlogError {
    fn from(e: r2d2::Error) -> Self {
        BlogError::Internal(format!("db connection failed: {e}"))
    }
}

/// Whether a SQLite error is a UNIQUE or other constraint violation.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}
