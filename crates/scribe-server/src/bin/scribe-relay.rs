//! Headless outbox relay.
//!
//! Claims NEW outbox rows and publishes them to the configured broker until
//! SIGINT/SIGTERM. Exits 1 if the store or broker is unreachable at startup.

use scribe_server::config::{self, BrokerKind, Config};
use scribe_server::relay::{OutboxRelay, RelaySettings};
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
            tracing::error!(error = %e, "outbox relay failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), StartupError> {
    if config.broker.kind == BrokerKind::Memory {
        return Err(StartupError::Unsupported(
            "the standalone relay needs a durable broker; set broker.kind to \"log\" or \"kafka\""
                .into(),
        ));
    }

    let pool = startup::open_store(&config.database)?;
    let broker = Broker::connect(&config.broker)?;
    let shutdown = startup::install_shutdown_handler();

    let relay = OutboxRelay::new(pool, broker.publisher(), RelaySettings::from(&config.relay));
    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { relay.run(shutdown).await }
    });
    startup::wait_for_shutdown(shutdown, vec![task], config.server.shutdown_grace()).await;
    Ok(())
}
