//! Audit consumer: projects bus events into `audit_log`.
//!
//! An offset is committed only after the message's effect is durable, either
//! as an audit row or as a dead letter. Redelivered events are absorbed by
//! the unique `event_id`, so processing is idempotent.

use std::time::Duration;

use scribe_bus::{BusError, Delivery, Subscription};
use scribe_db::DbPool;
use scribe_types::Envelope;
use tokio::sync::watch;

use crate::audit::{self, RecordOutcome};
use crate::config::ConsumerConfig;

/// Consumer tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// Consumer group the offsets belong to.
    pub group: String,
    /// Longest single wait for a message.
    pub fetch_wait: Duration,
    /// Pause before a message that hit a transient failure is retried.
    pub retry_backoff: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            group: scribe_types::DEFAULT_CONSUMER_GROUP.to_string(),
            fetch_wait: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl From<&ConsumerConfig> for ConsumerSettings {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            group: config.group.clone(),
            fetch_wait: Duration::from_millis(config.fetch_wait_ms),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// A new audit row was written and the offset committed.
    Recorded,
    /// The event was already recorded; the offset was committed.
    Duplicate,
    /// The message could not be processed and was parked in
    /// `consumer_dead_letters`; the offset was committed.
    DeadLettered,
    /// A transient failure; the offset was not committed and the message
    /// will be delivered again.
    Retry,
}

/// Failure of the blocking store step.
enum StoreFailure {
    Transient(String),
    Persistent(String),
}

impl From<rusqlite::Error> for StoreFailure {
    fn from(e: rusqlite::Error) -> Self {
        if scribe_db::is_transient(&e) {
            StoreFailure::Transient(e.to_string())
        } else {
            StoreFailure::Persistent(e.to_string())
        }
    }
}

impl From<r2d2::Error> for StoreFailure {
    fn from(e: r2d2::Error) -> Self {
        StoreFailure::Transient(format!("db connection failed: {e}"))
    }
}

impl From<tokio::task::JoinError> for StoreFailure {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreFailure::Transient(format!("task join error: {e}"))
    }
}

pub struct AuditConsumer {
    pool: DbPool,
    subscription: Box<dyn Subscription>,
    settings: ConsumerSettings,
}

impl AuditConsumer {
    pub fn new(pool: DbPool, subscription: Box<dyn Subscription>, settings: ConsumerSettings) -> Self {
        Self {
            pool,
            subscription,
            settings,
        }
    }

    /// Waits up to `fetch_wait` for one message and handles it.
    ///
    /// # Errors
    ///
    /// Returns the subscription's error if fetching failed.
    pub async fn poll_once(&mut self) -> Result<Option<HandleOutcome>, BusError> {
        match self.subscription.fetch(self.settings.fetch_wait).await? {
            Some(delivery) => Ok(Some(self.handle(&delivery).await)),
            None => Ok(None),
        }
    }

    /// Processes one delivery, then commits or rewinds it.
    pub async fn handle(&mut self, delivery: &Delivery) -> HandleOutcome {
        let outcome = match Envelope::from_wire(&delivery.value) {
            Ok(envelope) => match record(self.pool.clone(), envelope).await {
                Ok(RecordOutcome::Inserted) => HandleOutcome::Recorded,
                Ok(RecordOutcome::AlreadyRecorded) => HandleOutcome::Duplicate,
                Err(StoreFailure::Transient(e)) => {
                    tracing::warn!(
                        topic = %delivery.topic,
                        partition = delivery.partition,
                        offset = delivery.offset,
                        error = %e,
                        "audit write failed, message will be redelivered"
                    );
                    HandleOutcome::Retry
                }
                Err(StoreFailure::Persistent(e)) => {
                    dead_letter(self.pool.clone(), &self.settings.group, delivery, &e).await
                }
            },
            Err(e) => {
                let reason = format!("undecodable envelope: {e}");
                dead_letter(self.pool.clone(), &self.settings.group, delivery, &reason).await
            }
        };

        let acknowledged = match outcome {
            HandleOutcome::Retry => self.subscription.rewind(delivery).await,
            _ => self.subscription.commit(delivery).await,
        };
        if let Err(e) = acknowledged {
            // An uncommitted message is delivered again and absorbed as a duplicate.
            tracing::warn!(
                partition = delivery.partition,
                offset = delivery.offset,
                error = %e,
                "failed to acknowledge message"
            );
        }

        match outcome {
            HandleOutcome::Recorded => tracing::info!(
                group = %self.settings.group,
                partition = delivery.partition,
                offset = delivery.offset,
                "audit event recorded"
            ),
            HandleOutcome::Duplicate => tracing::debug!(
                partition = delivery.partition,
                offset = delivery.offset,
                "duplicate event skipped"
            ),
            HandleOutcome::DeadLettered | HandleOutcome::Retry => {}
        }
        outcome
    }

    /// Consumes until `shutdown` turns true. The message in hand when the
    /// signal arrives is finished first.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(group = %self.settings.group, "starting audit consumer");

        while !*shutdown.borrow() {
            let pause = match self.poll_once().await {
                Ok(Some(HandleOutcome::Retry)) => Some(self.settings.retry_backoff),
                Ok(_) => None,
                Err(e) => {
                    tracing::error!(error = %e, "failed to fetch from bus");
                    Some(self.settings.retry_backoff)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!(group = %self.settings.group, "audit consumer stopped");
    }
}

async fn record(pool: DbPool, envelope: Envelope) -> Result<RecordOutcome, StoreFailure> {
    tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        Ok::<_, StoreFailure>(audit::record_event(&conn, &envelope)?)
    })
    .await?
}

async fn dead_letter(pool: DbPool, group: &str, delivery: &Delivery, error: &str) -> HandleOutcome {
    let owned_group = group.to_string();
    let parked = delivery.clone();
    let error_text = error.to_string();
    let result = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        audit::insert_dead_letter(&conn, &owned_group, &parked, &error_text)?;
        Ok::<_, StoreFailure>(())
    })
    .await
    .map_err(StoreFailure::from)
    .and_then(|inner| inner);

    match result {
        Ok(()) => {
            tracing::error!(
                group,
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                error,
                "message dead-lettered"
            );
            HandleOutcome::DeadLettered
        }
        Err(StoreFailure::Transient(e) | StoreFailure::Persistent(e)) => {
            tracing::error!(
                partition = delivery.partition,
                offset = delivery.offset,
                error = %e,
                "failed to dead-letter message, will retry"
            );
            HandleOutcome::Retry
        }
    }
}
