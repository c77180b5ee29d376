//! Shared types, error definitions, and constants for the Scribe platform.
//!
//! This crate provides the foundational types used across all Scribe crates:
//! the canonical [`Envelope`] that carries a domain event over the bus, the
//! closed set of post payloads, and the outbox row status. It has no
//! knowledge of storage or transport.
//!
//! No crate in the workspace depends on anything *except* `scribe-types` for
//! cross-cutting type definitions. This keeps the dependency graph clean and
//! prevents circular dependencies.

use serde::{Deserialize, Serialize};

mod envelope;
mod post_event;

pub use envelope::{DomainEvent, Envelope, ENVELOPE_VERSION};
pub use post_event::{
    PayloadError, PostCreated, PostDeleted, PostEvent, PostUpdated, POST_AGGREGATE,
};

/// Default bus topic that blog domain events are published to.
pub const DEFAULT_TOPIC: &str = "blog.events";

/// Default consumer group name for the audit log consumer.
pub const DEFAULT_CONSUMER_GROUP: &str = "audit-log-consumer";

/// Lifecycle status of an outbox row.
///
/// `New` rows are eligible for relay; `Sent` is the terminal success state.
/// `Dead` is reached only when an attempt cap is configured and exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxStatus {
    /// Waiting to be published.
    New,
    /// Published and acknowledged by the bus.
    Sent,
    /// Gave up after the configured number of attempts.
    Dead,
}

impl OutboxStatus {
    /// Returns the canonical string stored in the `status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Sent => "SENT",
            Self::Dead => "DEAD",
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = ParseOutboxStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Self::New),
            "SENT" => Ok(Self::Sent),
            "DEAD" => Ok(Self::Dead),
            _ => Err(ParseOutboxStatusError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown outbox status string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown outbox status: {0}")]
pub struct ParseOutboxStatusError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbox_status_round_trip() {
        for status in [OutboxStatus::New, OutboxStatus::Sent, OutboxStatus::Dead] {
            let parsed: OutboxStatus = status.as_str().parse().expect("should parse");
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn outbox_status_rejects_unknown() {
        let err = "PENDING".parse::<OutboxStatus>().unwrap_err();
        assert_eq!(err.to_string(), "unknown outbox status: PENDING");
    }

    #[test]
    fn outbox_status_serializes_uppercase() {
        let json = serde_json::to_string(&OutboxStatus::Sent).unwrap();
        assert_eq!(json, "\"SENT\"");
    }
}
