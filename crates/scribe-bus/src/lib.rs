//! Event bus port and transports for the Scribe platform.
//!
//! [`EventBus`] is the producer contract used by the outbox relay and the
//! direct-publish write path: `publish` returns only once the transport has
//! durably accepted the message. [`Subscription`] is the consumer contract:
//! fetch, then commit after processing, or rewind to have the message
//! delivered again.
//!
//! Transports:
//!
//! - [`InMemoryBus`]: ordered, in-process, not durable. For single-process
//!   wiring and tests.
//! - [`LogBus`]: a partitioned commit log in its own SQLite database.
//! - `KafkaBus` (feature `kafka`): Kafka via `rdkafka`.
//!
//! Every transport keys messages by the envelope's aggregate ID, so events
//! of one aggregate stay in one partition and are consumed in order.

mod error;
#[cfg(feature = "kafka")]
mod kafka;
mod log;
mod memory;
mod port;

pub use error::{BusError, PublishError};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaBus, KafkaSettings, KafkaSubscription};
pub use log::{partition_for, LogBus, LogBusSettings, LogSubscription};
pub use memory::{InMemoryBus, MemorySubscription};
pub use port::{Delivery, EventBus, Subscription};
