//! Process wiring shared by the binaries: store, broker and shutdown.

use std::sync::Arc;
use std::time::Duration;

use scribe_bus::{BusError, EventBus, InMemoryBus, LogBus, LogBusSettings, Subscription};
use scribe_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use thiserror::Error;
use tokio::sync::watch;

use crate::config::{BrokerConfig, BrokerKind, ConfigError, DatabaseConfig};

/// Fatal errors while starting a binary.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open database: {0}")]
    Pool(#[from] scribe_db::PoolError),

    #[error("failed to get database connection: {0}")]
    Connection(#[from] r2d2::Error),

    #[error("failed to run database migrations: {0}")]
    Migration(#[from] scribe_db::MigrationError),

    #[error("failed to connect to broker: {0}")]
    Broker(#[from] BusError),

    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Unsupported(String),
}

/// Opens the primary store and applies pending migrations.
///
/// # Errors
///
/// Returns `StartupError` if the database cannot be opened or migrated.
pub fn open_store(config: &DatabaseConfig) -> Result<DbPool, StartupError> {
    let pool = create_pool(
        &config.path,
        DbRuntimeSettings {
            busy_timeout_ms: config.busy_timeout_ms,
            pool_max_size: config.pool_max_size,
            durable_commits: false,
        },
    )?;

    let conn = pool.get()?;
    let applied = run_migrations(&conn)?;
    if applied > 0 {
        tracing::info!(count = applied, "applied database migrations");
    }
    drop(conn);

    Ok(pool)
}

/// A connected event bus transport.
#[derive(Clone)]
pub enum Broker {
    Memory(InMemoryBus),
    Log(LogBus),
    #[cfg(feature = "kafka")]
    Kafka {
        bus: scribe_bus::KafkaBus,
        settings: scribe_bus::KafkaSettings,
    },
}

impl Broker {
    /// Connects to the configured transport. Kafka connectivity is checked
    /// with a metadata request so a dead cluster fails startup.
    ///
    /// # Errors
    ///
    /// Returns `StartupError::Broker` if the transport is unreachable and
    /// `StartupError::Unsupported` for Kafka in a build without the `kafka`
    /// feature.
    pub fn connect(config: &BrokerConfig) -> Result<Self, StartupError> {
        match config.kind {
            BrokerKind::Memory => Ok(Broker::Memory(InMemoryBus::new())),
            BrokerKind::Log => {
                let bus = LogBus::open(
                    &config.path,
                    LogBusSettings {
                        partitions: config.partitions,
                        poll_interval: Duration::from_millis(config.poll_interval_ms),
                        ..LogBusSettings::default()
                    },
                )?;
                tracing::info!(
                    path = %config.path,
                    partitions = config.partitions,
                    "opened log broker"
                );
                Ok(Broker::Log(bus))
            }
            #[cfg(feature = "kafka")]
            BrokerKind::Kafka => {
                let settings = scribe_bus::KafkaSettings {
                    brokers: config.brokers.clone(),
                    message_timeout: Duration::from_millis(config.message_timeout_ms),
                };
                let bus = scribe_bus::KafkaBus::new(&settings)?;
                bus.check_connection(settings.message_timeout)?;
                tracing::info!(brokers = %config.brokers, "connected to kafka");
                Ok(Broker::Kafka { bus, settings })
            }
            #[cfg(not(feature = "kafka"))]
            BrokerKind::Kafka => Err(StartupError::Unsupported(
                "broker.kind = \"kafka\" requires building with the `kafka` feature".into(),
            )),
        }
    }

    pub fn kind(&self) -> BrokerKind {
        match self {
            Broker::Memory(_) => BrokerKind::Memory,
            Broker::Log(_) => BrokerKind::Log,
            #[cfg(feature = "kafka")]
            Broker::Kafka { .. } => BrokerKind::Kafka,
        }
    }

    /// The publish side of the transport.
    pub fn publisher(&self) -> Arc<dyn EventBus> {
        match self {
            Broker::Memory(bus) => Arc::new(bus.clone()),
            Broker::Log(bus) => Arc::new(bus.clone()),
            #[cfg(feature = "kafka")]
            Broker::Kafka { bus, .. } => Arc::new(bus.clone()),
        }
    }

    /// Opens a subscription for `group` on `topic`.
    ///
    /// `partitions` restricts a log broker subscription to those
    /// partitions. The other transports ignore it: the in-memory bus has one
    /// partition and Kafka assigns partitions itself.
    ///
    /// # Errors
    ///
    /// Returns `StartupError::Broker` if the consumer cannot be created or
    /// the assignment is invalid.
    pub fn subscribe(
        &self,
        group: &str,
        topic: &str,
        partitions: Option<&[i32]>,
    ) -> Result<Box<dyn Subscription>, StartupError> {
        if partitions.is_some() && !matches!(self, Broker::Log(_)) {
            tracing::warn!(group, "consumer.partitions only applies to the log broker, ignoring");
        }
        match self {
            Broker::Memory(bus) => Ok(Box::new(bus.subscribe(group, topic))),
            Broker::Log(bus) => match partitions {
                Some(assigned) => Ok(Box::new(bus.subscribe_partitions(group, topic, assigned)?)),
                None => Ok(Box::new(bus.subscribe(group, topic))),
            },
            #[cfg(feature = "kafka")]
            Broker::Kafka { settings, .. } => Ok(Box::new(scribe_bus::KafkaSubscription::new(
                settings, group, topic,
            )?)),
        }
    }
}

/// Creates the shutdown channel and a task that flips it on SIGINT or
/// SIGTERM.
pub fn install_shutdown_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(true);
    });
    rx
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}

/// Waits for `shutdown` to turn true, then for `tasks` to finish, abandoning
/// them after `grace`.
pub async fn wait_for_shutdown(
    mut shutdown: watch::Receiver<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    grace: Duration,
) {
    let _ = shutdown.wait_for(|stop| *stop).await;
    join_with_grace(tasks, grace).await;
}

/// Waits for `tasks` to finish, abandoning them after `grace`.
pub async fn join_with_grace(tasks: Vec<tokio::task::JoinHandle<()>>, grace: Duration) {
    let all = async {
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "background task failed");
            }
        }
    };
    if tokio::time::timeout(grace, all).await.is_err() {
        tracing::warn!(
            grace_ms = grace.as_millis() as u64,
            "background tasks did not stop within the grace period"
        );
    }
}
