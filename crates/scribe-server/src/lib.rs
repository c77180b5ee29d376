//! Scribe server library logic.
//!
//! Hosts the HTTP API over the blog domain, the outbox relay, the audit
//! consumer and the retention task. The three binaries (`scribe-server`,
//! `scribe-relay`, `scribe-consumer`) are thin wrappers around these.

pub mod api;
pub mod audit;
pub mod config;
pub mod consumer;
pub mod middleware;
pub mod relay;
pub mod retention;
pub mod startup;
pub mod telemetry;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, patch, post},
    Extension, Json, Router,
};
use scribe_blog::{DeliveryMode, PostService};
use scribe_db::DbPool;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{Config, DeliveryModeKind};
use crate::consumer::{AuditConsumer, ConsumerSettings};
use crate::relay::{OutboxRelay, RelaySettings};
use crate::startup::{Broker, StartupError};

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// User, post, comment and like operations.
    pub posts: PostService,
}

impl AppState {
    /// Builds the state for `config.delivery`, publishing through `broker`
    /// in direct mode.
    pub fn new(pool: DbPool, config: &Config, broker: &Broker) -> Self {
        let delivery = match config.delivery.mode {
            DeliveryModeKind::Outbox => DeliveryMode::Outbox {
                topic: config.delivery.topic.clone(),
            },
            DeliveryModeKind::Direct => DeliveryMode::Direct {
                topic: config.delivery.topic.clone(),
                bus: broker.publisher(),
            },
        };
        Self {
            posts: PostService::new(pool.clone(), delivery),
            pool,
        }
    }
}

/// Maximum request body size (1 MiB).
const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let auth = || axum::middleware::from_fn(middleware::auth_middleware);

    Router::new()
        .route("/health", get(health))
        .route("/api/users", post(api::create_user_handler))
        .route(
            "/api/posts",
            get(api::list_posts_handler)
                .merge(post(api::create_post_handler).route_layer(auth())),
        )
        .route(
            "/api/posts/{slug}",
            get(api::get_post_handler).merge(
                patch(api::update_post_handler)
                    .merge(delete(api::delete_post_handler))
                    .route_layer(auth()),
            ),
        )
        .route(
            "/api/posts/{slug}/comments",
            get(api::list_comments_handler)
                .merge(post(api::create_comment_handler).route_layer(auth())),
        )
        .route("/api/posts/{slug}/likes", get(api::count_likes_handler))
        .route(
            "/api/posts/{slug}/like",
            post(api::like_post_handler)
                .merge(delete(api::unlike_post_handler))
                .route_layer(auth()),
        )
        .route(
            "/api/comments/{id}",
            delete(api::delete_comment_handler).route_layer(auth()),
        )
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}

/// Spawns the outbox relay and the audit consumer over `broker`.
///
/// Used by `scribe-server` when `relay.embedded` is set. Both tasks stop
/// when `shutdown` turns true.
///
/// # Errors
///
/// Returns `StartupError` if the consumer subscription cannot be opened.
pub fn spawn_pipeline(
    pool: DbPool,
    broker: &Broker,
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<()>>, StartupError> {
    let relay = OutboxRelay::new(
        pool.clone(),
        broker.publisher(),
        RelaySettings::from(&config.relay),
    );
    let subscription = broker.subscribe(
        &config.consumer.group,
        &config.delivery.topic,
        config.consumer.partitions.as_deref(),
    )?;
    let consumer = AuditConsumer::new(pool, subscription, ConsumerSettings::from(&config.consumer));

    let relay_shutdown = shutdown.clone();
    Ok(vec![
        tokio::spawn(async move { relay.run(relay_shutdown).await }),
        tokio::spawn(consumer.run(shutdown)),
    ])
}
