//! Persistence operations for the outbox.
//!
//! Writes that belong to a business operation go through
//! [`create_within_transaction`], which only accepts an open transaction.
//! Everything else is used by the relay ([`fetch_batch_for_publish`],
//! [`mark_sent`], [`mark_failed`]) or by operators and the retention task.

use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use scribe_db::{format_timestamp, now_timestamp};
use scribe_types::{Envelope, OutboxStatus};

use crate::error::OutboxError;
use crate::record::{InsertOutcome, OutboxRecord};

const RECORD_COLUMNS: &str = "id, event_id, topic, event_type, aggregate_type, aggregate_id,
    actor_user_id, correlation_id, version, payload, occurred_at, status, attempts,
    last_error, claimed_by, claimed_until, sent_at, created_at";

/// Parameters of one claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Identity of the claiming worker, stored in `claimed_by`.
    pub worker_id: String,
    /// Maximum number of rows to claim.
    pub limit: usize,
    /// How long the claim stays exclusive if the worker never reports back.
    pub lease: Duration,
}

/// Inserts one `NEW` outbox row using the caller's open transaction.
///
/// This function never begins or commits a transaction: the row becomes
/// visible exactly when the caller's business mutation commits, and
/// disappears with it on rollback.
///
/// # Errors
///
/// Returns `OutboxError::Storage` on SQL failure or
/// `OutboxError::Serialization` if the payload cannot be encoded. A
/// duplicate `event_id` is `Ok(InsertOutcome::Duplicate)`.
pub fn create_within_transaction(
    tx: &Transaction<'_>,
    topic: &str,
    envelope: &Envelope,
) -> Result<InsertOutcome, OutboxError> {
    let payload = serde_json::to_string(&envelope.payload)?;

    let inserted = tx.execute(
        "INSERT INTO outbox_events
            (event_id, topic, event_type, aggregate_type, aggregate_id,
             actor_user_id, correlation_id, version, payload, occurred_at, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'NEW')
         ON CONFLICT(event_id) DO NOTHING",
        params![
            envelope.event_id.to_string(),
            topic,
            envelope.event_type,
            envelope.aggregate_type,
            envelope.aggregate_id,
            envelope.actor_user_id,
            envelope.correlation_id,
            envelope.version,
            payload,
            format_timestamp(envelope.occurred_at),
        ],
    )?;

    if inserted == 0 {
        tracing::debug!(event_id = %envelope.event_id, "outbox event already recorded");
        return Ok(InsertOutcome::Duplicate);
    }

    Ok(InsertOutcome::Inserted(tx.last_insert_rowid()))
}

/// Claims up to `claim.limit` `NEW` rows for publishing, oldest first.
///
/// Runs as one short `IMMEDIATE` transaction: eligible rows (no lease, or
/// an expired one) are stamped with the worker ID and a lease deadline, and
/// returned in ascending `id` order. Rows leased by another live worker are
/// skipped rather than waited on, and so is every later row of the same
/// aggregate, which keeps one aggregate's events with a single worker at a
/// time. The lease ends when the row is marked sent or failed, when it is
/// released, or when it expires.
///
/// # Errors
///
/// Returns `OutboxError::Storage` if the store is unavailable or busy past
/// its timeout.
pub fn fetch_batch_for_publish(
    conn: &mut Connection,
    claim: &ClaimRequest,
) -> Result<Vec<OutboxRecord>, OutboxError> {
    if claim.limit == 0 {
        return Ok(Vec::new());
    }

    let now_ts = now_timestamp();
    let until_ts = lease_deadline(claim.lease);
    let limit = i64::try_from(claim.limit).unwrap_or(i64::MAX);

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut records = {
        let mut stmt = tx.prepare(&format!(
            "UPDATE outbox_events
             SET claimed_by = ?1, claimed_until = ?2
             WHERE id IN (
                SELECT o.id FROM outbox_events o
                WHERE o.status = 'NEW'
                  AND (o.claimed_until IS NULL OR o.claimed_until <= ?3)
                  AND NOT EXISTS (
                    SELECT 1 FROM outbox_events earlier
                    WHERE earlier.aggregate_type = o.aggregate_type
                      AND earlier.aggregate_id = o.aggregate_id
                      AND earlier.status = 'NEW'
                      AND earlier.id < o.id
                      AND earlier.claimed_until > ?3
                  )
                ORDER BY o.id ASC
                LIMIT ?4
             )
             RETURNING {RECORD_COLUMNS}"
        ))?;
        let rows = stmt.query_map(
            params![claim.worker_id, until_ts, now_ts, limit],
            map_record,
        )?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    tx.commit()?;

    // RETURNING order is unspecified.
    records.sort_by_key(|r| r.id);
    Ok(records)
}

/// Extends this worker's lease on a `NEW` row to `lease` from now.
///
/// Returns `false` if the worker no longer holds the row: it was claimed by
/// another worker after the lease expired, or it left `NEW`. A worker must
/// not publish a row it failed to renew. An expired lease nobody else took
/// is still renewed.
///
/// # Errors
///
/// Returns `OutboxError::Storage` on SQL failure.
pub fn renew_lease(
    conn: &Connection,
    id: i64,
    worker_id: &str,
    lease: Duration,
) -> Result<bool, OutboxError> {
    let updated = conn.execute(
        "UPDATE outbox_events
         SET claimed_until = ?3
         WHERE id = ?1 AND claimed_by = ?2 AND status = 'NEW'",
        params![id, worker_id, lease_deadline(lease)],
    )?;
    Ok(updated > 0)
}

/// Gives up this worker's lease on a `NEW` row without recording an
/// attempt. Returns `false` if the worker did not hold it.
///
/// # Errors
///
/// Returns `OutboxError::Storage` on SQL failure.
pub fn release_claim(conn: &Connection, id: i64, worker_id: &str) -> Result<bool, OutboxError> {
    let updated = conn.execute(
        "UPDATE outbox_events
         SET claimed_by = NULL, claimed_until = NULL
         WHERE id = ?1 AND claimed_by = ?2 AND status = 'NEW'",
        params![id, worker_id],
    )?;
    Ok(updated > 0)
}

fn lease_deadline(lease: Duration) -> String {
    let now = chrono::Utc::now();
    let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(365));
    format_timestamp(now.checked_add_signed(lease).unwrap_or(now))
}

/// Transitions a row to `SENT`, clearing its error and lease.
///
/// `sent_at` is only written on the first call, so marking twice is
/// harmless.
///
/// # Errors
///
/// Returns `OutboxError::NotFound` if the row does not exist, or
/// `OutboxError::Storage` on SQL failure.
pub fn mark_sent(conn: &Connection, id: i64) -> Result<(), OutboxError> {
    let updated = conn.execute(
        "UPDATE outbox_events
         SET status = 'SENT',
             sent_at = COALESCE(sent_at, ?2),
             last_error = NULL,
             claimed_by = NULL,
             claimed_until = NULL
         WHERE id = ?1",
        params![id, now_timestamp()],
    )?;
    if updated == 0 {
        return Err(OutboxError::NotFound(id));
    }
    Ok(())
}

/// Records a failed publish attempt and releases the lease.
///
/// The row stays `NEW` and becomes claimable on the next poll, unless
/// `max_attempts` is non-zero and this failure reaches it, in which case the
/// row becomes `DEAD`. Rows that are no longer `NEW` (another worker sent
/// them after a lease expiry) are left untouched.
///
/// Returns the row's status after the update.
///
/// # Errors
///
/// Returns `OutboxError::NotFound` if the row does not exist, or
/// `OutboxError::Storage` on SQL failure.
pub fn mark_failed(
    conn: &Connection,
    id: i64,
    error_text: &str,
    max_attempts: u32,
) -> Result<OutboxStatus, OutboxError> {
    let status: Option<String> = conn
        .query_row(
            "UPDATE outbox_events
             SET attempts = attempts + 1,
                 last_error = ?2,
                 claimed_by = NULL,
                 claimed_until = NULL,
                 status = CASE
                     WHEN ?3 > 0 AND attempts + 1 >= ?3 THEN 'DEAD'
                     ELSE status
                 END
             WHERE id = ?1 AND status = 'NEW'
             RETURNING status",
            params![id, error_text, max_attempts],
            |row| row.get(0),
        )
        .optional()?;

    let status = match status {
        Some(status) => status,
        None => conn
            .query_row(
                "SELECT status FROM outbox_events WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(OutboxError::NotFound(id))?,
    };

    parse_status(&status).map_err(OutboxError::Storage)
}

/// Loads a row by its ID.
///
/// # Errors
///
/// Returns `OutboxError::Storage` on SQL failure.
pub fn get_record(conn: &Connection, id: i64) -> Result<Option<OutboxRecord>, OutboxError> {
    let record = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM outbox_events WHERE id = ?1"),
            [id],
            map_record,
        )
        .optional()?;
    Ok(record)
}

/// Loads a row by its event ID.
///
/// # Errors
///
/// Returns `OutboxError::Storage` on SQL failure.
pub fn get_by_event_id(
    conn: &Connection,
    event_id: &str,
) -> Result<Option<OutboxRecord>, OutboxError> {
    let record = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM outbox_events WHERE event_id = ?1"),
            [event_id],
            map_record,
        )
        .optional()?;
    Ok(record)
}

/// Counts rows in the given status.
///
/// # Errors
///
/// Returns `OutboxError::Storage` on SQL failure.
pub fn count_by_status(conn: &Connection, status: OutboxStatus) -> Result<i64, OutboxError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM outbox_events WHERE status = ?1",
        [status.as_str()],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Lists `DEAD` rows, oldest first.
///
/// # Errors
///
/// Returns `OutboxError::Storage` on SQL failure.
pub fn list_dead(conn: &Connection, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS} FROM outbox_events
         WHERE status = 'DEAD'
         ORDER BY id ASC
         LIMIT ?1"
    ))?;
    let rows = stmt.query_map([limit], map_record)?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

/// Puts a `DEAD` row back in the queue with a fresh attempt budget.
///
/// Returns `false` if the row is not `DEAD`.
///
/// # Errors
///
/// Returns `OutboxError::Storage` on SQL failure.
pub fn requeue_dead(conn: &Connection, id: i64) -> Result<bool, OutboxError> {
    let updated = conn.execute(
        "UPDATE outbox_events
         SET status = 'NEW', attempts = 0, claimed_by = NULL, claimed_until = NULL
         WHERE id = ?1 AND status = 'DEAD'",
        [id],
    )?;
    if updated > 0 {
        tracing::info!(outbox_id = id, "requeued dead outbox event");
    }
    Ok(updated > 0)
}

/// Deletes up to `limit` `SENT` rows whose `sent_at` is before `cutoff`.
///
/// `cutoff` uses the shared timestamp format. Returns the number of rows
/// deleted; callers loop while it equals `limit`.
///
/// # Errors
///
/// Returns `OutboxError::Storage` on SQL failure.
pub fn purge_sent_before(
    conn: &Connection,
    cutoff: &str,
    limit: usize,
) -> Result<usize, OutboxError> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let deleted = conn.execute(
        "DELETE FROM outbox_events
         WHERE id IN (
            SELECT id FROM outbox_events
            WHERE status = 'SENT' AND sent_at < ?1
            ORDER BY id ASC
            LIMIT ?2
         )",
        params![cutoff, limit],
    )?;
    Ok(deleted)
}

fn parse_status(raw: &str) -> Result<OutboxStatus, rusqlite::Error> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            11,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<OutboxRecord> {
    let status: String = row.get(11)?;
    Ok(OutboxRecord {
        id: row.get(0)?,
        event_id: row.get(1)?,
        topic: row.get(2)?,
        event_type: row.get(3)?,
        aggregate_type: row.get(4)?,
        aggregate_id: row.get(5)?,
        actor_user_id: row.get(6)?,
        correlation_id: row.get(7)?,
        version: row.get(8)?,
        payload: row.get(9)?,
        occurred_at: row.get(10)?,
        status: parse_status(&status)?,
        attempts: row.get(12)?,
        last_error: row.get(13)?,
        claimed_by: row.get(14)?,
        claimed_until: row.get(15)?,
        sent_at: row.get(16)?,
        created_at: row.get(17)?,
    })
}
