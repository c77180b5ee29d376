//! SQLite-backed partitioned commit log.
//!
//! The log broker keeps its own database, separate from the primary store,
//! opened with `synchronous = FULL` so that a returned publish has reached
//! stable storage. Each topic is split into a fixed number of partitions;
//! a message's partition is a stable hash of its key, so every event of one
//! aggregate lands in the same partition and is read back in append order.
//!
//! There is no group coordinator. A subscription reads the partitions it is
//! given: [`LogBus::subscribe`] takes all of them, which suits a single
//! consumer per group. Several members of one group must be handed disjoint
//! sets through [`LogBus::subscribe_partitions`]; members that share a
//! partition both receive its messages, and committed offsets only ever
//! move forward, so the overlap costs duplicate deliveries rather than lost
//! ones.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use scribe_db::{apply_migrations, create_pool, DbPool, DbRuntimeSettings, Migration};
use scribe_types::Envelope;
use sha2::{Digest, Sha256};

use crate::error::{BusError, PublishError};
use crate::port::{Delivery, EventBus, Subscription};

const BROKER_MIGRATIONS: &[Migration] = &[
    Migration {
        name: "bus_000_messages",
        sql: include_str!("migrations/000_bus_messages.sql"),
    },
    Migration {
        name: "bus_001_consumer_offsets",
        sql: include_str!("migrations/001_bus_consumer_offsets.sql"),
    },
];

/// Tunables for the log broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogBusSettings {
    /// Number of partitions per topic. Changing it remaps keys.
    pub partitions: u32,
    /// Delay between polls while a subscription waits for new messages.
    pub poll_interval: Duration,
    /// SQLite busy timeout for broker connections, in milliseconds.
    pub busy_timeout_ms: u64,
    /// Maximum number of pooled broker connections.
    pub pool_max_size: u32,
}

impl Default for LogBusSettings {
    fn default() -> Self {
        Self {
            partitions: 4,
            poll_interval: Duration::from_millis(100),
            busy_timeout_ms: 5_000,
            pool_max_size: 4,
        }
    }
}

/// Maps a message key to a partition in `0..partitions`.
///
/// Uses the first four bytes of the key's SHA-256 digest so the mapping is
/// identical across processes and builds.
pub fn partition_for(key: &[u8], partitions: u32) -> i32 {
    let digest = Sha256::digest(key);
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    i32::try_from(prefix % partitions.max(1)).unwrap_or(0)
}

/// An [`EventBus`] that appends to the SQLite commit log.
#[derive(Clone)]
pub struct LogBus {
    pool: DbPool,
    settings: LogBusSettings,
}

impl LogBus {
    /// Opens (and if needed creates) the broker database at `path`.
    ///
    /// # Errors
    ///
    /// Returns `BusError` if the database cannot be opened or migrated, or
    /// if `settings.partitions` is zero.
    pub fn open(path: &str, settings: LogBusSettings) -> Result<Self, BusError> {
        let pool = create_pool(
            path,
            DbRuntimeSettings {
                busy_timeout_ms: settings.busy_timeout_ms,
                pool_max_size: settings.pool_max_size,
                durable_commits: true,
            },
        )?;
        Self::with_pool(pool, settings)
    }

    /// Wraps an existing pool, applying the broker schema.
    ///
    /// # Errors
    ///
    /// Returns `BusError` if the schema cannot be applied or the settings
    /// are invalid.
    pub fn with_pool(pool: DbPool, settings: LogBusSettings) -> Result<Self, BusError> {
        if settings.partitions == 0 || settings.partitions > i32::MAX as u32 {
            return Err(BusError::Config(format!(
                "partitions must be between 1 and {}, got {}",
                i32::MAX,
                settings.partitions
            )));
        }

        let conn = pool.get()?;
        let applied = apply_migrations(&conn, BROKER_MIGRATIONS)?;
        if applied > 0 {
            tracing::info!(count = applied, "applied broker migrations");
        }

        Ok(Self { pool, settings })
    }

    /// Opens a subscription for `group` on `topic` over every partition,
    /// resuming from the group's committed offsets.
    pub fn subscribe(&self, group: &str, topic: &str) -> LogSubscription {
        let all = (0..self.settings.partitions)
            .filter_map(|p| i32::try_from(p).ok())
            .collect();
        self.subscription(group, topic, all)
    }

    /// Opens a subscription for `group` on `topic` that reads only
    /// `partitions`, for running several members of one group side by side.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Config` if `partitions` is empty or names a
    /// partition outside `0..partitions()`.
    pub fn subscribe_partitions(
        &self,
        group: &str,
        topic: &str,
        partitions: &[i32],
    ) -> Result<LogSubscription, BusError> {
        let count = self.settings.partitions;
        if partitions.is_empty() {
            return Err(BusError::Config("partition assignment is empty".to_string()));
        }
        if let Some(bad) = partitions
            .iter()
            .find(|p| u32::try_from(**p).map_or(true, |p| p >= count))
        {
            return Err(BusError::Config(format!(
                "partition {bad} is outside 0..{count}"
            )));
        }
        let mut assigned = partitions.to_vec();
        assigned.sort_unstable();
        assigned.dedup();
        Ok(self.subscription(group, topic, assigned))
    }

    fn subscription(&self, group: &str, topic: &str, assigned: Vec<i32>) -> LogSubscription {
        tracing::debug!(group, topic, partitions = ?assigned, "opening log subscription");
        LogSubscription {
            pool: self.pool.clone(),
            group: group.to_string(),
            topic: topic.to_string(),
            assigned,
            poll_interval: self.settings.poll_interval,
            state: ReadState::default(),
        }
    }

    /// Number of messages stored for `topic` across all partitions.
    ///
    /// # Errors
    ///
    /// Returns `BusError` on connection or query failure.
    pub fn message_count(&self, topic: &str) -> Result<i64, BusError> {
        let conn = self.pool.get()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM bus_messages WHERE topic = ?1",
            [topic],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Reads one partition of `topic` from offset 0, for inspection.
    ///
    /// # Errors
    ///
    /// Returns `BusError` on connection or query failure.
    pub fn read_partition(&self, topic: &str, partition: i32) -> Result<Vec<Delivery>, BusError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT msg_offset, message_key, message_value FROM bus_messages
             WHERE topic = ?1 AND partition_id = ?2
             ORDER BY msg_offset ASC",
        )?;
        let rows = stmt.query_map(params![topic, partition], |row| {
            Ok(Delivery {
                topic: topic.to_string(),
                partition,
                offset: row.get(0)?,
                key: row.get(1)?,
                value: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn partitions(&self) -> u32 {
        self.settings.partitions
    }
}

fn append(
    pool: &DbPool,
    topic: &str,
    partition: i32,
    key: &[u8],
    value: &[u8],
) -> Result<i64, PublishError> {
    let mut conn = pool
        .get()
        .map_err(|e| PublishError::Unavailable(e.to_string()))?;
    let transport = |e: rusqlite::Error| PublishError::Transport(e.to_string());

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(transport)?;
    let offset: i64 = tx
        .query_row(
            "SELECT COALESCE(MAX(msg_offset) + 1, 0) FROM bus_messages
             WHERE topic = ?1 AND partition_id = ?2",
            params![topic, partition],
            |row| row.get(0),
        )
        .map_err(transport)?;
    tx.execute(
        "INSERT INTO bus_messages (topic, partition_id, msg_offset, message_key, message_value)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![topic, partition, offset, key, value],
    )
    .map_err(transport)?;
    tx.commit().map_err(transport)?;

    Ok(offset)
}

#[async_trait]
impl EventBus for LogBus {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), PublishError> {
        let value = envelope.to_wire()?;
        let key = envelope.key().to_vec();
        let partition = partition_for(&key, self.settings.partitions);
        let pool = self.pool.clone();
        let owned_topic = topic.to_string();

        let offset = tokio::task::spawn_blocking(move || {
            append(&pool, &owned_topic, partition, &key, &value)
        })
        .await
        .map_err(|e| PublishError::Transport(format!("append task failed: {e}")))??;

        tracing::debug!(
            topic,
            partition,
            offset,
            event_id = %envelope.event_id,
            "appended to log broker"
        );
        Ok(())
    }
}

/// Subscription over a [`LogBus`] for one consumer group.
///
/// The assigned partitions are visited round-robin; within a partition
/// messages are yielded strictly in offset order.
pub struct LogSubscription {
    pool: DbPool,
    group: String,
    topic: String,
    assigned: Vec<i32>,
    poll_interval: Duration,
    state: ReadState,
}

#[derive(Debug, Default)]
struct ReadState {
    /// Next offset to read per partition. Loaded from the committed offsets
    /// on first fetch.
    positions: Option<HashMap<i32, i64>>,
    /// Index into the assigned partitions.
    cursor: usize,
}

fn load_positions(
    conn: &rusqlite::Connection,
    group: &str,
    topic: &str,
) -> Result<HashMap<i32, i64>, BusError> {
    let mut stmt = conn.prepare(
        "SELECT partition_id, next_offset FROM bus_consumer_offsets
         WHERE consumer_group = ?1 AND topic = ?2",
    )?;
    let rows = stmt.query_map(params![group, topic], |row| {
        Ok((row.get::<_, i32>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut positions = HashMap::new();
    for row in rows {
        let (partition, offset) = row?;
        positions.insert(partition, offset);
    }
    Ok(positions)
}

/// Looks for the next message, starting at the round-robin cursor.
fn poll_once(
    pool: &DbPool,
    group: &str,
    topic: &str,
    assigned: &[i32],
    state: &mut ReadState,
) -> Result<Option<Delivery>, BusError> {
    let conn = pool.get()?;
    if state.positions.is_none() {
        state.positions = Some(load_positions(&conn, group, topic)?);
    }
    let positions = state.positions.get_or_insert_with(HashMap::new);

    for step in 0..assigned.len() {
        let index = (state.cursor + step) % assigned.len();
        let partition = assigned[index];
        let position = positions.get(&partition).copied().unwrap_or(0);

        let found = conn
            .query_row(
                "SELECT msg_offset, message_key, message_value FROM bus_messages
                 WHERE topic = ?1 AND partition_id = ?2 AND msg_offset >= ?3
                 ORDER BY msg_offset ASC
                 LIMIT 1",
                params![topic, partition, position],
                |row| {
                    Ok(Delivery {
                        topic: topic.to_string(),
                        partition,
                        offset: row.get(0)?,
                        key: row.get(1)?,
                        value: row.get(2)?,
                    })
                },
            )
            .optional()?;

        if let Some(delivery) = found {
            positions.insert(partition, delivery.offset + 1);
            state.cursor = (index + 1) % assigned.len();
            return Ok(Some(delivery));
        }
    }
    Ok(None)
}

#[async_trait]
impl Subscription for LogSubscription {
    async fn fetch(&mut self, wait: Duration) -> Result<Option<Delivery>, BusError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let pool = self.pool.clone();
            let group = self.group.clone();
            let topic = self.topic.clone();
            let assigned = self.assigned.clone();
            let mut state = std::mem::take(&mut self.state);

            let (state, polled) = tokio::task::spawn_blocking(move || {
                let polled = poll_once(&pool, &group, &topic, &assigned, &mut state);
                (state, polled)
            })
            .await
            .map_err(|e| BusError::Transport(format!("fetch task failed: {e}")))?;
            self.state = state;

            if let Some(delivery) = polled? {
                return Ok(Some(delivery));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        let pool = self.pool.clone();
        let group = self.group.clone();
        let delivery = delivery.clone();
        tokio::task::spawn_blocking(move || -> Result<(), BusError> {
            let conn = pool.get()?;
            conn.execute(
                "INSERT INTO bus_consumer_offsets
                    (consumer_group, topic, partition_id, next_offset, updated_at)
                 VALUES (?1, ?2, ?3, ?4, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                 ON CONFLICT(consumer_group, topic, partition_id) DO UPDATE SET
                    next_offset = MAX(next_offset, excluded.next_offset),
                    updated_at = excluded.updated_at",
                params![group, delivery.topic, delivery.partition, delivery.offset + 1],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| BusError::Transport(format!("commit task failed: {e}")))?
    }

    async fn rewind(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        if let Some(positions) = self.state.positions.as_mut() {
            positions.insert(delivery.partition, delivery.offset);
        }
        if let Some(index) = self.assigned.iter().position(|p| *p == delivery.partition) {
            self.state.cursor = index;
        }
        Ok(())
    }
}
