//! Kafka transport built on `rdkafka`.
//!
//! The producer runs with `acks=all` and idempotence enabled, and `publish`
//! awaits the delivery report, so `Ok(())` means every in-sync replica has
//! the message. The consumer disables auto-commit; offsets are committed
//! explicitly after the application has processed a message.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use scribe_types::Envelope;

use crate::error::{BusError, PublishError};
use crate::port::{Delivery, EventBus, Subscription};

/// Connection settings shared by the Kafka producer and consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaSettings {
    /// Comma-separated `host:port` list.
    pub brokers: String,
    /// Upper bound on how long a publish may wait for its delivery report.
    pub message_timeout: Duration,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            message_timeout: Duration::from_secs(10),
        }
    }
}

fn map_publish_error(e: KafkaError) -> PublishError {
    match e {
        KafkaError::ClientCreation(msg) => PublishError::Unavailable(msg),
        other => PublishError::Transport(other.to_string()),
    }
}

fn map_bus_error(e: KafkaError) -> BusError {
    BusError::Transport(e.to_string())
}

/// An [`EventBus`] publishing to Kafka.
#[derive(Clone)]
pub struct KafkaBus {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaBus {
    /// Creates the producer. Does not contact the cluster.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Config` if the client cannot be configured.
    pub fn new(settings: &KafkaSettings) -> Result<Self, BusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set(
                "message.timeout.ms",
                settings.message_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| BusError::Config(e.to_string()))?;

        Ok(Self {
            producer,
            timeout: settings.message_timeout,
        })
    }

    /// Verifies the cluster is reachable by fetching metadata.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Transport` if no broker answers within `timeout`.
    pub fn check_connection(&self, timeout: Duration) -> Result<(), BusError> {
        use rdkafka::producer::Producer;

        self.producer
            .client()
            .fetch_metadata(None, Timeout::After(timeout))
            .map(|_| ())
            .map_err(map_bus_error)
    }
}

#[async_trait]
impl EventBus for KafkaBus {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), PublishError> {
        let value = envelope.to_wire()?;
        let record = FutureRecord::to(topic)
            .key(envelope.key())
            .payload(&value);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _msg)| map_publish_error(e))?;

        tracing::debug!(
            topic,
            partition,
            offset,
            event_id = %envelope.event_id,
            "kafka delivery acknowledged"
        );
        Ok(())
    }
}

/// A consumer-group subscription on one Kafka topic.
pub struct KafkaSubscription {
    consumer: StreamConsumer,
}

impl KafkaSubscription {
    /// Joins `group` and subscribes to `topic`, starting from the earliest
    /// offset when the group has no committed position.
    ///
    /// # Errors
    ///
    /// Returns `BusError` if the consumer cannot be created or subscribed.
    pub fn new(settings: &KafkaSettings, group: &str, topic: &str) -> Result<Self, BusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| BusError::Config(e.to_string()))?;
        consumer.subscribe(&[topic]).map_err(map_bus_error)?;
        Ok(Self { consumer })
    }
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn fetch(&mut self, wait: Duration) -> Result<Option<Delivery>, BusError> {
        let message = match tokio::time::timeout(wait, self.consumer.recv()).await {
            Err(_elapsed) => return Ok(None),
            Ok(result) => result.map_err(map_bus_error)?,
        };

        Ok(Some(Delivery {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec).unwrap_or_default(),
            value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }))
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &delivery.topic,
                delivery.partition,
                Offset::Offset(delivery.offset + 1),
            )
            .map_err(map_bus_error)?;
        self.consumer
            .commit(&offsets, CommitMode::Sync)
            .map_err(map_bus_error)
    }

    async fn rewind(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        self.consumer
            .seek(
                &delivery.topic,
                delivery.partition,
                Offset::Offset(delivery.offset),
                Timeout::After(Duration::from_secs(5)),
            )
            .map_err(map_bus_error)
    }
}
