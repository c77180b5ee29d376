//! Database layer for the Scribe platform.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! embedded SQL migrations, and small query helpers shared by the store
//! crates. Every table in the primary store is created through versioned
//! migrations managed by this crate.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: concurrent readers with a single writer, and
//!   real transactions so a business mutation and its outbox row commit or
//!   roll back together.
//! - **`r2d2` connection pool**: bounded connection reuse shared by the HTTP
//!   handlers, the relay and the consumer.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!`. Other crates that own a separate database (the log
//!   broker) reuse the same runner with their own migration list.

mod migrations;
mod pool;
mod time;

pub use migrations::{apply_migrations, run_migrations, Migration, MigrationError};
pub use pool::{create_pool, is_transient, DbPool, DbRuntimeSettings, PoolError};
pub use time::{format_timestamp, now_timestamp};
