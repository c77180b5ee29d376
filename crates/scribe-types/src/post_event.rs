//! Domain event payloads for the `post` aggregate.

use serde::{Deserialize, Serialize};

use crate::envelope::DomainEvent;

/// Aggregate type tag for posts.
pub const POST_AGGREGATE: &str = "post";

/// Body of a `PostCreated` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostCreated {
    pub post_id: String,
    pub title: String,
    pub slug: String,
}

/// Body of a `PostUpdated` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostUpdated {
    pub post_id: String,
    pub title: String,
    pub slug: String,
}

/// Body of a `PostDeleted` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostDeleted {
    pub post_id: String,
}

/// The closed set of events emitted for posts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostEvent {
    Created(PostCreated),
    Updated(PostUpdated),
    Deleted(PostDeleted),
}

/// Error returned when a payload cannot be interpreted as a post event.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// The `event_type` tag does not belong to the post aggregate.
    #[error("unknown post event type: {0}")]
    UnknownType(String),

    /// The body does not match the schema for its tag.
    #[error("malformed {event_type} payload: {source}")]
    Malformed {
        event_type: String,
        source: serde_json::Error,
    },
}

impl PostEvent {
    /// Reconstructs a typed event from its tag and JSON body.
    pub fn decode(event_type: &str, payload: &serde_json::Value) -> Result<Self, PayloadError> {
        let malformed = |source| PayloadError::Malformed {
            event_type: event_type.to_string(),
            source,
        };
        match event_type {
            "PostCreated" => serde_json::from_value(payload.clone())
                .map(Self::Created)
                .map_err(malformed),
            "PostUpdated" => serde_json::from_value(payload.clone())
                .map(Self::Updated)
                .map_err(malformed),
            "PostDeleted" => serde_json::from_value(payload.clone())
                .map(Self::Deleted)
                .map_err(malformed),
            other => Err(PayloadError::UnknownType(other.to_string())),
        }
    }

    /// The post this event is about.
    pub fn post_id(&self) -> &str {
        match self {
            Self::Created(p) => &p.post_id,
            Self::Updated(p) => &p.post_id,
            Self::Deleted(p) => &p.post_id,
        }
    }
}

impl DomainEvent for PostEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created(_) => "PostCreated",
            Self::Updated(_) => "PostUpdated",
            Self::Deleted(_) => "PostDeleted",
        }
    }

    fn aggregate_type(&self) -> &'static str {
        POST_AGGREGATE
    }

    fn aggregate_id(&self) -> String {
        self.post_id().to_string()
    }

    fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Created(p) => serde_json::to_value(p),
            Self::Updated(p) => serde_json::to_value(p),
            Self::Deleted(p) => serde_json::to_value(p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_matches_event_type_tag() {
        let event = PostEvent::Updated(PostUpdated {
            post_id: "3".to_string(),
            title: "New".to_string(),
            slug: "old-slug".to_string(),
        });
        let body = event.payload().unwrap();

        let decoded = PostEvent::decode(event.event_type(), &body).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let err = PostEvent::decode("PostLiked", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, PayloadError::UnknownType(ref t) if t == "PostLiked"));
    }

    #[test]
    fn decode_rejects_body_missing_fields() {
        let err =
            PostEvent::decode("PostCreated", &serde_json::json!({ "post_id": "1" })).unwrap_err();
        assert!(matches!(err, PayloadError::Malformed { .. }));
    }

    #[test]
    fn deleted_payload_only_carries_id() {
        let event = PostEvent::Deleted(PostDeleted {
            post_id: "11".to_string(),
        });
        assert_eq!(event.payload().unwrap(), serde_json::json!({ "post_id": "11" }));
        assert_eq!(event.aggregate_id(), "11");
    }
}
