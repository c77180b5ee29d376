//! The producer and consumer contracts every transport implements.

use std::time::Duration;

use async_trait::async_trait;
use scribe_types::Envelope;

use crate::error::{BusError, PublishError};

/// Publish side of the bus.
///
/// `publish` returns only after the transport has durably accepted the
/// message, so a caller may treat `Ok(())` as permission to mark the event
/// sent. Implementations do not retry.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes one envelope to `topic`, keyed by its aggregate ID.
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), PublishError>;
}

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Message key (the envelope's aggregate ID).
    pub key: Vec<u8>,
    /// Encoded envelope.
    pub value: Vec<u8>,
}

/// Consumer side of the bus, bound to one consumer group and topic.
///
/// Messages of a partition are yielded in offset order. A message that is
/// not committed is delivered again after a [`rewind`](Self::rewind) or a
/// restart of the group.
#[async_trait]
pub trait Subscription: Send {
    /// Waits up to `wait` for the next message. `Ok(None)` on timeout.
    async fn fetch(&mut self, wait: Duration) -> Result<Option<Delivery>, BusError>;

    /// Records `delivery` (and everything before it in its partition) as
    /// processed for the group.
    async fn commit(&mut self, delivery: &Delivery) -> Result<(), BusError>;

    /// Moves the read position of the delivery's partition back to it, so
    /// the next fetch from that partition returns it again.
    async fn rewind(&mut self, delivery: &Delivery) -> Result<(), BusError>;
}
