//! Scribe server binary: the HTTP API over the blog domain.
//!
//! Starts an axum HTTP server with structured logging, database
//! initialization, the outbox retention task and graceful shutdown on
//! SIGTERM/SIGINT. With `relay.embedded = true` it also runs the outbox
//! relay and the audit consumer in-process.

use scribe_server::config::{self, BrokerKind, Config};
use scribe_server::startup::{self, Broker, StartupError};
use scribe_server::{app, retention, spawn_pipeline, telemetry, AppState};
use std::net::SocketAddr;
use std::process::ExitCode;
use tokio::net::TcpListener;

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
    tracing::info!(
        source = config_source,
        path = %config_path,
        "resolved startup configuration path"
    );

    match run(config).await {
        Ok(()) => {
            tracing::info!("scribe server shut down");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "scribe server failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), StartupError> {
    if config.broker.kind == BrokerKind::Memory && !config.relay.embedded {
        return Err(StartupError::Unsupported(
            "broker.kind = \"memory\" only works with relay.embedded = true".into(),
        ));
    }

    let pool = startup::open_store(&config.database)?;
    let broker = Broker::connect(&config.broker)?;
    let shutdown = startup::install_shutdown_handler();

    let mut tasks = Vec::new();
    if config.relay.embedded {
        tracing::info!("running embedded relay and audit consumer");
        tasks.extend(spawn_pipeline(pool.clone(), &broker, &config, shutdown.clone())?);
    }
    tasks.push(tokio::spawn(retention::start_retention_task(
        pool.clone(),
        config.retention.clone(),
        shutdown.clone(),
    )));

    let state = AppState::new(pool, &config, &broker);
    let addr = SocketAddr::new(config.server.host, config.server.port);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(
        %addr,
        delivery = ?config.delivery.mode,
        broker = ?broker.kind(),
        "starting scribe server"
    );

    let mut server_shutdown = shutdown.clone();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    startup::join_with_grace(tasks, config.server.shutdown_grace()).await;
    Ok(())
}
