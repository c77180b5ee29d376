//! The canonical wire representation of a domain event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schema version stamped on envelopes produced by this build.
pub const ENVELOPE_VERSION: u32 = 1;

/// A domain event that can be wrapped in an [`Envelope`].
///
/// Each aggregate type owns a closed set of variants; the variant decides the
/// `event_type` tag and the JSON body carried in `payload`.
pub trait DomainEvent {
    /// The tag identifying the variant (e.g. `PostCreated`).
    fn event_type(&self) -> &'static str;

    /// The kind of entity the event is about (e.g. `post`).
    fn aggregate_type(&self) -> &'static str;

    /// The identifier of the entity. Also the bus ordering key.
    fn aggregate_id(&self) -> String;

    /// Serialises the variant-specific body.
    fn payload(&self) -> Result<serde_json::Value, serde_json::Error>;
}

/// Immutable unit of transmission between the outbox, the bus and consumers.
///
/// Serialised as JSON:
///
/// ```json
/// {
///   "event_id": "1f0c...",
///   "event_type": "PostCreated",
///   "occurred_at": "2024-05-01T10:00:00Z",
///   "aggregate_type": "post",
///   "aggregate_id": "42",
///   "actor_user_id": "7",
///   "version": 1,
///   "payload": { "post_id": "42", "title": "Hello", "slug": "hello" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Globally unique event identifier; the downstream idempotency key.
    pub event_id: Uuid,
    /// Variant tag of the payload.
    pub event_type: String,
    /// When the business change happened (not when it was transmitted).
    pub occurred_at: DateTime<Utc>,
    /// Kind of entity the event is about.
    pub aggregate_type: String,
    /// Entity identifier, used as the partition key.
    pub aggregate_id: String,
    /// Who caused the change, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_user_id: Option<String>,
    /// Cross-system tracing identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Payload schema version.
    pub version: u32,
    /// Variant-specific body.
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Wraps a domain event, assigning a fresh `event_id` and `occurred_at`.
    ///
    /// This is the only place an `event_id` is generated. Everything
    /// downstream (outbox row, relay retries, consumers) reuses it.
    pub fn record<E: DomainEvent>(
        event: &E,
        actor_user_id: Option<String>,
        correlation_id: Option<String>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type: event.event_type().to_string(),
            occurred_at: Utc::now(),
            aggregate_type: event.aggregate_type().to_string(),
            aggregate_id: event.aggregate_id(),
            actor_user_id,
            correlation_id,
            version: ENVELOPE_VERSION,
            payload: event.payload()?,
        })
    }

    /// The message key used by partitioned transports.
    pub fn key(&self) -> &[u8] {
        self.aggregate_id.as_bytes()
    }

    /// Encodes the envelope as a JSON message value.
    pub fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes an envelope from a JSON message value.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
