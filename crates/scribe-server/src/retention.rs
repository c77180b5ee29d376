//! Background task that purges old SENT outbox rows.

use chrono::Utc;
use scribe_db::{format_timestamp, DbPool};
use scribe_outbox::{purge_sent_before, OutboxError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::config::RetentionConfig;

/// Rows deleted per statement.
const PURGE_BATCH: usize = 5_000;

/// Errors from a retention pass.
#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("purge failed: {0}")]
    Purge(#[from] OutboxError),

    #[error("no database connection: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("retention task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Deletes SENT rows whose `sent_at` is older than `max_age`, in batches.
/// Returns the number of rows deleted.
///
/// # Errors
///
/// Returns `RetentionError` on connection or SQL failure. Rows deleted by
/// earlier batches stay deleted.
pub async fn purge_once(pool: DbPool, max_age: Duration) -> Result<usize, RetentionError> {
    let max_age =
        chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
    let cutoff = Utc::now()
        .checked_sub_signed(max_age)
        .map(format_timestamp)
        .unwrap_or_default();

    tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        let mut total = 0;
        loop {
            let deleted = purge_sent_before(&conn, &cutoff, PURGE_BATCH)?;
            total += deleted;
            if deleted < PURGE_BATCH {
                break;
            }
        }
        Ok::<_, RetentionError>(total)
    })
    .await?
}

/// Periodically purges SENT rows until `shutdown` turns true.
///
/// Returns immediately when `sent_retention_hours` is `0`.
pub async fn start_retention_task(
    pool: DbPool,
    config: RetentionConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    if config.sent_retention_hours == 0 {
        tracing::info!("outbox retention disabled, sent rows are kept");
        return;
    }

    let interval = Duration::from_secs(config.interval_seconds.max(1));
    let max_age = Duration::from_secs(config.sent_retention_hours.saturating_mul(3_600));
    tracing::info!(
        interval_seconds = interval.as_secs(),
        sent_retention_hours = config.sent_retention_hours,
        "starting outbox retention task"
    );

    loop {
        tokio::select! {
            _ = sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }

        match purge_once(pool.clone(), max_age).await {
            Ok(count) if count > 0 => tracing::info!(count, "purged sent outbox rows"),
            Ok(_) => tracing::debug!("no sent outbox rows to purge"),
            Err(e) => tracing::error!(error = %e, "failed to purge sent outbox rows"),
        }
    }
}
