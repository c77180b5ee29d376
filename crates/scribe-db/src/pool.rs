//! SQLite connection pool shared by every Scribe component.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::time::Duration;
use thiserror::Error;

/// Per-connection SQLite tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a statement waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Upper bound on open connections in the pool.
    pub pool_max_size: u32,

    /// Run with `synchronous = FULL` so a commit is on disk before it
    /// returns. The primary store uses `NORMAL`; the log broker needs
    /// `FULL` because its acknowledgement must survive power loss.
    pub durable_commits: bool,
}

impl DbRuntimeSettings {
    fn synchronous(&self) -> &'static str {
        if self.durable_commits {
            "FULL"
        } else {
            "NORMAL"
        }
    }
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
            durable_commits: false,
        }
    }
}

/// Pooled SQLite connections shared by the store, relay and consumer.
pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("could not build sqlite pool: {0}")]
    Build(#[from] r2d2::Error),
}

/// Applies WAL journaling, foreign keys, the commit durability level and
/// the busy timeout to a freshly opened connection.
fn prepare_connection(conn: &mut Connection, settings: DbRuntimeSettings) -> rusqlite::Result<()> {
    let journal: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    // `:memory:` databases cannot use WAL and report "memory".
    if !matches!(journal.as_str(), "wal" | "memory") {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("journal_mode is {journal}, expected wal")),
        ));
    }
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.pragma_update(None, "synchronous", settings.synchronous())?;
    conn.busy_timeout(Duration::from_millis(settings.busy_timeout_ms))
}

/// Opens a pool over the SQLite file at `db_path`, creating it if needed.
///
/// `:memory:` gives every pooled connection its own private database, so
/// anything that shares state across connections (including the tests of
/// the relay and consumer) must use a file.
///
/// # Errors
///
/// Returns `PoolError::Build` if the first connection cannot be opened or
/// configured.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| prepare_connection(conn, settings));

    Ok(Pool::builder()
        .max_size(settings.pool_max_size)
        .build(manager)?)
}

/// Whether a SQLite error is likely to clear up if the operation is retried.
///
/// Lock contention and I/O failures are transient; constraint violations,
/// schema mismatches and type errors are not.
pub fn is_transient(err: &rusqlite::Error) -> bool {
    use rusqlite::ErrorCode;

    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::CannotOpen
                | ErrorCode::DiskFull
                | ErrorCode::OutOfMemory
        ),
        _ => false,
    }
}
