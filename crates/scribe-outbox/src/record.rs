//! Outbox row types.

use chrono::{DateTime, Utc};
use scribe_types::{Envelope, OutboxStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OutboxError;

/// Result of inserting an event into the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was created with the given ID.
    Inserted(i64),
    /// A row with the same `event_id` already exists. Callers treat this as
    /// success: retrying a business operation must not enqueue twice.
    Duplicate,
}

/// A single row from the `outbox_events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Store-assigned, monotonically increasing row ID.
    pub id: i64,
    /// The envelope's event ID (UUID text).
    pub event_id: String,
    /// The bus topic the event is destined for.
    pub topic: String,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub actor_user_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Payload schema version.
    pub version: u32,
    /// The JSON-encoded payload.
    pub payload: String,
    pub occurred_at: String,
    pub status: OutboxStatus,
    /// Number of failed publish attempts.
    pub attempts: u32,
    /// Most recent failure, cleared on success.
    pub last_error: Option<String>,
    /// Worker currently holding the lease, if any.
    pub claimed_by: Option<String>,
    /// When the current lease lapses.
    pub claimed_until: Option<String>,
    /// Set once, when the row transitions to `SENT`.
    pub sent_at: Option<String>,
    pub created_at: String,
}

impl OutboxRecord {
    /// Rebuilds the envelope from the denormalised row.
    ///
    /// The `event_id` is taken from the row, never regenerated, so every
    /// retry of the same row carries the same identity.
    ///
    /// # Errors
    ///
    /// Returns `OutboxError::InvalidRecord` if the stored event ID,
    /// timestamp or payload cannot be parsed.
    pub fn to_envelope(&self) -> Result<Envelope, OutboxError> {
        let invalid = |reason: String| OutboxError::InvalidRecord {
            id: self.id,
            reason,
        };

        let event_id = Uuid::parse_str(&self.event_id)
            .map_err(|e| invalid(format!("event_id: {e}")))?;
        let occurred_at = DateTime::parse_from_rfc3339(&self.occurred_at)
            .map_err(|e| invalid(format!("occurred_at: {e}")))?
            .with_timezone(&Utc);
        let payload: serde_json::Value = serde_json::from_str(&self.payload)
            .map_err(|e| invalid(format!("payload: {e}")))?;

        Ok(Envelope {
            event_id,
            event_type: self.event_type.clone(),
            occurred_at,
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            actor_user_id: self.actor_user_id.clone(),
            correlation_id: self.correlation_id.clone(),
            version: self.version,
            payload,
        })
    }
}
