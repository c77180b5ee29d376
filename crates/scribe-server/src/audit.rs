//! Audit log projection written by the audit consumer.

use rusqlite::{params, Connection, OptionalExtension, Row};
use scribe_bus::Delivery;
use scribe_db::format_timestamp;
use scribe_types::Envelope;
use serde::Serialize;

/// Whether an event was new to the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    /// The `event_id` was already recorded.
    AlreadyRecorded,
}

/// One row of `audit_log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub event_id: String,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub actor_user_id: Option<String>,
    pub payload: String,
    pub occurred_at: String,
    pub created_at: String,
}

/// Records an event, ignoring duplicates by `event_id`.
///
/// # Errors
///
/// Returns the SQLite error if the insert fails for any other reason.
pub fn record_event(conn: &Connection, envelope: &Envelope) -> Result<RecordOutcome, rusqlite::Error> {
    let payload = envelope.payload.to_string();
    let changed = conn.execute(
        "INSERT INTO audit_log
            (event_id, event_type, aggregate_type, aggregate_id, actor_user_id, payload, occurred_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(event_id) DO NOTHING",
        params![
            envelope.event_id.to_string(),
            envelope.event_type,
            envelope.aggregate_type,
            envelope.aggregate_id,
            envelope.actor_user_id,
            payload,
            format_timestamp(envelope.occurred_at),
        ],
    )?;
    Ok(if changed == 0 {
        RecordOutcome::AlreadyRecorded
    } else {
        RecordOutcome::Inserted
    })
}

/// Lists the audit trail of one aggregate, oldest first.
pub fn list_for_aggregate(
    conn: &Connection,
    aggregate_type: &str,
    aggregate_id: &str,
) -> Result<Vec<AuditEntry>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, event_id, event_type, aggregate_type, aggregate_id, actor_user_id,
                payload, occurred_at, created_at
         FROM audit_log
         WHERE aggregate_type = ?1 AND aggregate_id = ?2
         ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![aggregate_type, aggregate_id], map_row_to_entry)?;
    rows.collect()
}

pub fn get_by_event_id(conn: &Connection, event_id: &str) -> Result<Option<AuditEntry>, rusqlite::Error> {
    conn.query_row(
        "SELECT id, event_id, event_type, aggregate_type, aggregate_id, actor_user_id,
                payload, occurred_at, created_at
         FROM audit_log WHERE event_id = ?1",
        [event_id],
        map_row_to_entry,
    )
    .optional()
}

pub fn count_entries(conn: &Connection) -> Result<i64, rusqlite::Error> {
    conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
}

/// Stores a message the consumer gave up on. Recording the same message
/// twice keeps the first row.
pub fn insert_dead_letter(
    conn: &Connection,
    group: &str,
    delivery: &Delivery,
    error: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO consumer_dead_letters
            (consumer_group, topic, partition_id, msg_offset, message_key, message_value, error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(consumer_group, topic, partition_id, msg_offset) DO NOTHING",
        params![
            group,
            delivery.topic,
            delivery.partition,
            delivery.offset,
            delivery.key,
            delivery.value,
            error,
        ],
    )?;
    Ok(())
}

pub fn count_dead_letters(conn: &Connection, group: &str) -> Result<i64, rusqlite::Error> {
    conn.query_row(
        "SELECT COUNT(*) FROM consumer_dead_letters WHERE consumer_group = ?1",
        [group],
        |row| row.get(0),
    )
}

fn map_row_to_entry(row: &Row) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.get(0)?,
        event_id: row.get(1)?,
        event_type: row.get(2)?,
        aggregate_type: row.get(3)?,
        aggregate_id: row.get(4)?,
        actor_user_id: row.get(5)?,
        payload: row.get(6)?,
        occurred_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}
