//! Error types for bus producers and subscriptions.

/// A publish did not reach durable acknowledgement.
///
/// Every variant is retryable from the caller's point of view. Transports
/// never retry internally.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The broker rejected the write or the connection failed mid-request.
    #[error("bus transport error: {0}")]
    Transport(String),

    /// The envelope could not be encoded as a message value.
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    /// The broker could not be reached at all.
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by subscriptions and broker setup.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The broker store rejected or could not execute a statement.
    #[error("bus storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// No broker connection could be obtained.
    #[error("bus connection error: {0}")]
    Connection(String),

    /// The broker schema could not be created.
    #[error("bus migration failed: {0}")]
    Migration(#[from] scribe_db::MigrationError),

    /// A client-side transport error (e.g. Kafka consumer).
    #[error("bus transport error: {0}")]
    Transport(String),

    /// Invalid broker configuration.
    #[error("invalid bus configuration: {0}")]
    Config(String),
}

impl From<r2d2::Error> for BusError {
    fn from(e: r2d2::Error) -> Self {
        BusError::Connection(e.to_string())
    }
}

impl From<scribe_db::PoolError> for BusError {
    fn from(e: scribe_db::PoolError) -> Self {
        BusError::Connection(e.to_string())
    }
}

impl BusError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BusError::Storage(e) => scribe_db::is_transient(e),
            BusError::Connection(_) | BusError::Transport(_) => true,
            BusError::Migration(_) | BusError::Config(_) => false,
        }
    }
}
