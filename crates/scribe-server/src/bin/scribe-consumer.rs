//! Headless audit consumer.
//!
//! Reads the domain event topic as the configured consumer group and writes
//! each event to `audit_log` until SIGINT/SIGTERM. Exits 1 if the store or
//! broker is unreachable at startup.

use scribe_server::config::{self, BrokerKind, Config};
use scribe_server::consumer::{AuditConsumer, ConsumerSettings};
use scribe_server::startup::{self, Broker, StartupError};
use scribe_server::telemetry;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let (config_path, config_source) = config::resolve_config_path();
    let config = match config::load_config(Some(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration from {config_path}: {e}");
            return ExitCode::FAILURE;
        }
    };

    telemetry::init_tracing(&config.logging);
    tracing::info!(source = config_source, path = %config_path, "resolved startup configuration path");

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "audit consumer failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), StartupError> {
    if config.broker.kind == BrokerKind::Memory {
        return Err(StartupError::Unsupported(
            "the standalone consumer needs a durable broker; set broker.kind to \"log\" or \"kafka\""
                .into(),
        ));
    }

    let pool = startup::open_store(&config.database)?;
    let broker = Broker::connect(&config.broker)?;
    let subscription = broker.subscribe(
        &config.consumer.group,
        &config.delivery.topic,
        config.consumer.partitions.as_deref(),
    )?;
    let shutdown = startup::install_shutdown_handler();

    let consumer = AuditConsumer::new(pool, subscription, ConsumerSettings::from(&config.consumer));
    let task = tokio::spawn(consumer.run(shutdown.clone()));
    startup::wait_for_shutdown(shutdown, vec![task], config.server.shutdown_grace()).await;
    Ok(())
}
