//! Error types for the outbox store.

/// Errors that can occur during outbox operations.
///
/// A duplicate `event_id` is not an error; it is reported as
/// [`InsertOutcome::Duplicate`](crate::InsertOutcome::Duplicate).
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    /// The store rejected or could not execute a statement.
    #[error("outbox storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("outbox serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No outbox row exists with the given ID.
    #[error("outbox row {0} not found")]
    NotFound(i64),

    /// A stored row cannot be turned back into an envelope.
    #[error("outbox row {id} is not a valid envelope: {reason}")]
    InvalidRecord {
        /// The row ID.
        id: i64,
        /// What was wrong with it.
        reason: String,
    },
}
