//! Schema migrations compiled into the binary.
//!
//! Applied names are recorded in `_scribe_migrations`; a list is replayed
//! in order and anything already recorded is skipped.

use std::collections::HashSet;

use rusqlite::Connection;
use thiserror::Error;

/// A single embedded migration.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Unique, ordered name (e.g. `003_outbox_events`).
    pub name: &'static str,
    /// SQL executed as one batch inside a transaction.
    pub sql: &'static str,
}

/// Primary store migrations in order. New migrations are appended here.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "000_init",
        sql: include_str!("migrations/000_init.sql"),
    },
    Migration {
        name: "001_users",
        sql: include_str!("migrations/001_users.sql"),
    },
    Migration {
        name: "002_posts",
        sql: include_str!("migrations/002_posts.sql"),
    },
    Migration {
        name: "003_outbox_events",
        sql: include_str!("migrations/003_outbox_events.sql"),
    },
    Migration {
        name: "004_audit_log",
        sql: include_str!("migrations/004_audit_log.sql"),
    },
    Migration {
        name: "005_consumer_dead_letters",
        sql: include_str!("migrations/005_consumer_dead_letters.sql"),
    },
    Migration {
        name: "006_comments_likes",
        sql: include_str!("migrations/006_comments_likes.sql"),
    },
];

#[derive(Debug, Error)]
pub enum MigrationError {
    /// A migration's SQL or its bookkeeping insert failed; nothing of it
    /// was kept.
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        source: rusqlite::Error,
    },

    /// The set of applied migrations could not be read.
    #[error("failed to read applied migrations: {0}")]
    StateQuery(rusqlite::Error),
}

const BOOTSTRAP: &str = "CREATE TABLE IF NOT EXISTS _scribe_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);";

/// Brings the primary store schema up to date. Returns how many
/// migrations were applied.
///
/// # Errors
///
/// Returns `MigrationError` on the first migration that fails.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply_migrations(conn, MIGRATIONS)
}

fn applied_names(conn: &Connection) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT name FROM _scribe_migrations")?;
    let names = stmt.query_map([], |row| row.get(0))?;
    names.collect()
}

/// Applies `migrations` in order, skipping those already recorded.
///
/// Crates that own a database other than the primary store (the log
/// broker) pass their own list. A migration and its bookkeeping row commit
/// together.
///
/// # Errors
///
/// Returns `MigrationError` on the first migration that fails. Earlier
/// migrations stay applied.
pub fn apply_migrations(
    conn: &Connection,
    migrations: &[Migration],
) -> Result<usize, MigrationError> {
    conn.execute_batch(BOOTSTRAP)
        .map_err(|source| MigrationError::ExecutionFailed {
            name: "_scribe_migrations".to_string(),
            source,
        })?;
    let done = applied_names(conn).map_err(MigrationError::StateQuery)?;

    let mut count = 0;
    for migration in migrations.iter().filter(|m| !done.contains(m.name)) {
        let apply = || -> rusqlite::Result<()> {
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(migration.sql)?;
            tx.execute(
                "INSERT INTO _scribe_migrations (name) VALUES (?1)",
                [migration.name],
            )?;
            tx.commit()
        };
        apply().map_err(|source| MigrationError::ExecutionFailed {
            name: migration.name.to_string(),
            source,
        })?;
        tracing::info!(migration = migration.name, "applied migration");
        count += 1;
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [name],
            |row| row.get(0),
        )
        .expect("should query sqlite_master")
    }

    #[test]
    fn run_migrations_on_fresh_db() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let applied = run_migrations(&conn).expect("migrations should succeed");
        assert_eq!(applied, MIGRATIONS.len());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM _scribe_migrations", [], |row| {
                row.get(0)
            })
            .expect("should query migration count");
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[test]
    fn run_migrations_idempotent() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");

        let first = run_migrations(&conn).expect("first run should succeed");
        assert_eq!(first, 7);

        let second = run_migrations(&conn).expect("second run should succeed");
        assert_eq!(second, 0, "no new migrations to apply");
    }

    #[test]
    fn core_tables_exist() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        run_migrations(&conn).expect("migrations should succeed");

        for table in [
            "users",
            "posts",
            "outbox_events",
            "audit_log",
            "consumer_dead_letters",
            "comments",
            "post_likes",
        ] {
            assert!(table_exists(&conn, table), "{table} table should exist");
        }
    }

    #[test]
    fn outbox_event_id_is_unique() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        run_migrations(&conn).expect("migrations should succeed");

        let insert = "INSERT INTO outbox_events
            (event_id, topic, event_type, aggregate_type, aggregate_id, payload, occurred_at)
            VALUES ('5b0f8a5e-8a0c-4a8e-9a55-1d8f1f3c2b11', 't', 'PostCreated', 'post', '1', '{}', 'now')";
        conn.execute(insert, []).expect("first insert");
        let err = conn.execute(insert, []).expect_err("duplicate event_id");
        assert!(err.to_string().contains("UNIQUE"), "unexpected error: {err}");
    }

    #[test]
    fn migration_side_effects_rollback_when_tracking_insert_fails() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let migrations = [Migration {
            name: "001_tracking_insert_conflict",
            sql: "
                CREATE TABLE rollback_marker (id INTEGER PRIMARY KEY);
                INSERT INTO _scribe_migrations (name) VALUES ('001_tracking_insert_conflict');
            ",
        }];

        let err = apply_migrations(&conn, &migrations)
            .expect_err("tracking insert conflict should fail migration");

        match err {
            MigrationError::ExecutionFailed { name, .. } => {
                assert_eq!(name, "001_tracking_insert_conflict")
            }
            other => panic!("unexpected error type: {other:?}"),
        }

        assert!(
            !table_exists(&conn, "rollback_marker"),
            "schema side effects should be rolled back when tracking insert fails"
        );
    }
}
