//! Outbox relay: moves committed events from the outbox to the bus.
//!
//! Each tick claims a batch of NEW rows under a lease, publishes them in
//! ascending ID order, and marks every row sent or failed individually. A
//! failed row does not stop the batch, but the rest of its aggregate's rows
//! are released unpublished so they cannot overtake it. The lease on each
//! row is renewed right before its publish; a row whose lease was lost to
//! another relay is skipped. A crash after a publish but before its
//! mark-sent leaves the row claimable once the lease expires, so the event
//! is published again: delivery is at-least-once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use scribe_bus::EventBus;
use scribe_db::DbPool;
use scribe_outbox::{
    fetch_batch_for_publish, mark_failed, mark_sent, release_claim, renew_lease, ClaimRequest,
    OutboxError, OutboxRecord,
};
use scribe_types::OutboxStatus;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::RelayConfig;

/// Relay tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    /// Maximum rows claimed per tick.
    pub batch_size: usize,
    /// Time between claims.
    pub poll_interval: Duration,
    /// How long claimed rows are hidden from other relays.
    pub lease: Duration,
    /// Attempts before a row becomes DEAD. `0` retries forever.
    pub max_attempts: u32,
    /// Recorded as `claimed_by` on claimed rows.
    pub worker_id: String,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(30),
            max_attempts: 20,
            worker_id: generate_worker_id(),
        }
    }
}

impl From<&RelayConfig> for RelaySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            lease: Duration::from_millis(config.lease_ms),
            max_attempts: config.max_attempts,
            worker_id: config
                .worker_id
                .clone()
                .unwrap_or_else(generate_worker_id),
        }
    }
}

fn generate_worker_id() -> String {
    format!("relay-{}", uuid::Uuid::new_v4())
}

/// Outcome counts of one relay tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Rows claimed.
    pub claimed: usize,
    /// Rows published and marked SENT.
    pub sent: usize,
    /// Rows whose publish failed and that remain NEW.
    pub failed: usize,
    /// Rows whose publish failed and that reached the attempt cap.
    pub dead: usize,
    /// Rows handed back unpublished: the lease was lost, or an earlier row
    /// of the same aggregate did not go out in this batch.
    pub skipped: usize,
}

impl BatchReport {
    fn absorb(&mut self, other: BatchReport) {
        self.claimed += other.claimed;
        self.sent += other.sent;
        self.failed += other.failed;
        self.dead += other.dead;
        self.skipped += other.skipped;
    }

    /// Every claimed row was published.
    fn all_sent(&self) -> bool {
        self.sent == self.claimed
    }
}

/// Errors that abort a relay tick. Per-row failures never surface here.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("claim failed: {0}")]
    Claim(#[from] OutboxError),

    #[error("no database connection: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("relay task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result of publishing one row.
enum RowOutcome {
    Sent,
    Failed,
    Dead,
    LeaseLost,
}

/// Publishes outbox rows to an [`EventBus`].
#[derive(Clone)]
pub struct OutboxRelay {
    pool: DbPool,
    bus: Arc<dyn EventBus>,
    settings: RelaySettings,
}

impl OutboxRelay {
    pub fn new(pool: DbPool, bus: Arc<dyn EventBus>, settings: RelaySettings) -> Self {
        Self {
            pool,
            bus,
            settings,
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Claims one batch and publishes it.
    ///
    /// # Errors
    ///
    /// Returns `RelayError` only if the claim itself failed; nothing was
    /// published in that case.
    pub async fn run_once(&self) -> Result<BatchReport, RelayError> {
        let records = self.claim().await?;
        let mut report = BatchReport {
            claimed: records.len(),
            ..BatchReport::default()
        };

        let mut held_back: HashSet<(String, String)> = HashSet::new();
        for record in records {
            let aggregate = (record.aggregate_type.clone(), record.aggregate_id.clone());
            if held_back.contains(&aggregate) {
                self.release(record.id).await;
                report.skipped += 1;
                continue;
            }
            match self.relay_record(record).await {
                RowOutcome::Sent => {
                    report.sent += 1;
                    continue;
                }
                RowOutcome::Failed => report.failed += 1,
                RowOutcome::Dead => report.dead += 1,
                RowOutcome::LeaseLost => report.skipped += 1,
            }
            held_back.insert(aggregate);
        }

        if report.claimed > 0 {
            tracing::debug!(
                worker_id = %self.settings.worker_id,
                claimed = report.claimed,
                sent = report.sent,
                failed = report.failed,
                dead = report.dead,
                skipped = report.skipped,
                "relay batch finished"
            );
        }
        Ok(report)
    }

    /// Runs batches back to back until a claim comes back empty or a batch
    /// publishes nothing, and returns the summed report.
    ///
    /// # Errors
    ///
    /// Returns the first claim error.
    pub async fn drain(&self) -> Result<BatchReport, RelayError> {
        let mut total = BatchReport::default();
        loop {
            let report = self.run_once().await?;
            total.absorb(report);
            if report.claimed == 0 || report.sent == 0 {
                return Ok(total);
            }
        }
    }

    /// Polls until `shutdown` turns true. The batch in progress when the
    /// signal arrives is finished first. A full batch that was published
    /// in its entirety is followed by another claim without waiting for the
    /// next tick; any failure waits for the tick, so an outage is retried at
    /// the poll rate.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            worker_id = %self.settings.worker_id,
            batch_size = self.settings.batch_size,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            max_attempts = self.settings.max_attempts,
            "starting outbox relay"
        );

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            loop {
                match self.run_once().await {
                    Ok(report)
                        if report.claimed >= self.settings.batch_size && report.all_sent() =>
                    {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    Ok(_) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "outbox claim failed, retrying next tick");
                        break;
                    }
                }
            }
        }

        tracing::info!(worker_id = %self.settings.worker_id, "outbox relay stopped");
    }

    async fn claim(&self) -> Result<Vec<OutboxRecord>, RelayError> {
        let pool = self.pool.clone();
        let request = ClaimRequest {
            worker_id: self.settings.worker_id.clone(),
            limit: self.settings.batch_size,
            lease: self.settings.lease,
        };
        let records = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            Ok::<_, RelayError>(fetch_batch_for_publish(&mut conn, &request)?)
        })
        .await??;
        Ok(records)
    }

    async fn relay_record(&self, record: OutboxRecord) -> RowOutcome {
        match self.renew(record.id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    id = record.id,
                    event_id = %record.event_id,
                    worker_id = %self.settings.worker_id,
                    "outbox lease lost before publish, skipping row"
                );
                return RowOutcome::LeaseLost;
            }
            Err(e) => {
                tracing::error!(
                    id = record.id,
                    event_id = %record.event_id,
                    error = %e,
                    "failed to renew outbox lease, skipping row"
                );
                return RowOutcome::LeaseLost;
            }
        }

        let publish_result = match record.to_envelope() {
            Ok(envelope) => self
                .bus
                .publish(&record.topic, &envelope)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(format!("marshal error: {e}")),
        };

        match publish_result {
            Ok(()) => {
                if let Err(e) = self.mark(record.id, None).await {
                    // The lease expires and the row is published again.
                    tracing::error!(
                        id = record.id,
                        event_id = %record.event_id,
                        error = %e,
                        "published but failed to mark outbox row sent"
                    );
                    return RowOutcome::Failed;
                }
                tracing::info!(
                    id = record.id,
                    event_id = %record.event_id,
                    event_type = %record.event_type,
                    aggregate_id = %record.aggregate_id,
                    topic = %record.topic,
                    "outbox event published"
                );
                RowOutcome::Sent
            }
            Err(error_text) => match self.mark(record.id, Some(error_text.clone())).await {
                Ok(OutboxStatus::Dead) => {
                    tracing::error!(
                        id = record.id,
                        event_id = %record.event_id,
                        attempts = record.attempts + 1,
                        error = %error_text,
                        "outbox event reached attempt cap, marked dead"
                    );
                    RowOutcome::Dead
                }
                Ok(_) => {
                    tracing::warn!(
                        id = record.id,
                        event_id = %record.event_id,
                        attempts = record.attempts + 1,
                        error = %error_text,
                        "outbox event publish failed, will retry"
                    );
                    RowOutcome::Failed
                }
                Err(e) => {
                    tracing::error!(
                        id = record.id,
                        event_id = %record.event_id,
                        publish_error = %error_text,
                        error = %e,
                        "failed to record outbox publish failure"
                    );
                    RowOutcome::Failed
                }
            },
        }
    }

    async fn renew(&self, id: i64) -> Result<bool, RelayError> {
        let pool = self.pool.clone();
        let worker_id = self.settings.worker_id.clone();
        let lease = self.settings.lease;
        let renewed = tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            Ok::<_, RelayError>(renew_lease(&conn, id, &worker_id, lease)?)
        })
        .await??;
        Ok(renewed)
    }

    /// Hands a held-back row to the next claim. A failure only delays the
    /// row until its lease expires.
    async fn release(&self, id: i64) {
        let pool = self.pool.clone();
        let worker_id = self.settings.worker_id.clone();
        let released = tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            Ok::<_, RelayError>(release_claim(&conn, id, &worker_id)?)
        })
        .await
        .map_err(RelayError::from)
        .and_then(|result| result);
        if let Err(e) = released {
            tracing::warn!(id, error = %e, "failed to release outbox row");
        }
    }

    /// Marks a row sent (`error` is `None`) or failed.
    async fn mark(&self, id: i64, error: Option<String>) -> Result<OutboxStatus, RelayError> {
        let pool = self.pool.clone();
        let max_attempts = self.settings.max_attempts;
        let status = tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let status = match error {
                None => {
                    mark_sent(&conn, id)?;
                    OutboxStatus::Sent
                }
                Some(text) => mark_failed(&conn, id, &text, max_attempts)?,
            };
            Ok::<_, RelayError>(status)
        })
        .await??;
        Ok(status)
    }
}
