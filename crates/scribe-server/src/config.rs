//! Configuration loading from file and environment variables.
//!
//! One file configures all three binaries; each reads the sections it needs.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Primary store settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Event bus transport.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// How the write path hands events to the bus.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Outbox relay tuning.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Audit consumer tuning.
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Purging of old sent outbox rows.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// How long a binary waits for in-flight work after a shutdown signal.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

/// Primary store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Busy timeout for SQLite connections, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Which transport backs the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process log. Only meaningful when relay and consumer run embedded.
    Memory,
    /// SQLite-backed partitioned commit log at `broker.path`.
    Log,
    /// Kafka at `broker.brokers`. Requires the `kafka` feature.
    Kafka,
}

/// Event bus configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_kind")]
    pub kind: BrokerKind,

    /// Path of the log broker database.
    #[serde(default = "default_broker_path")]
    pub path: String,

    /// Partition count of the log broker.
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// How often a log subscription polls for new messages.
    #[serde(default = "default_broker_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Kafka bootstrap servers.
    #[serde(default = "default_kafka_brokers")]
    pub brokers: String,

    /// Kafka delivery timeout for one publish.
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
}

/// How committed mutations reach the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryModeKind {
    /// Record events in the outbox; the relay publishes them.
    Outbox,
    /// Publish synchronously after commit. Can lose events.
    Direct,
}

/// Write-path delivery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_delivery_mode")]
    pub mode: DeliveryModeKind,

    /// Topic domain events are published to.
    #[serde(default = "default_topic")]
    pub topic: String,
}

/// Outbox relay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Run the relay and the audit consumer inside `scribe-server`.
    #[serde(default)]
    pub embedded: bool,

    /// Maximum rows claimed per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Time between claim attempts.
    #[serde(default = "default_relay_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long a claim protects rows from other relays.
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,

    /// Attempts before a row is marked DEAD. `0` retries forever.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Name recorded on claimed rows. Defaults to a random ID per process.
    #[serde(default)]
    pub worker_id: Option<String>,
}

/// Audit consumer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer group name.
    #[serde(default = "default_consumer_group")]
    pub group: String,

    /// Longest single wait for a message before checking for shutdown.
    #[serde(default = "default_fetch_wait_ms")]
    pub fetch_wait_ms: u64,

    /// Pause after a transient failure before the message is retried.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Log broker partitions this member reads. Unset reads all of them.
    /// Members of one group must be given disjoint sets.
    #[serde(default)]
    pub partitions: Option<Vec<i32>>,
}

/// Retention configuration for SENT outbox rows.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Age after which SENT rows are deleted. `0` keeps them forever.
    #[serde(default = "default_sent_retention_hours")]
    pub sent_retention_hours: u64,

    /// Time between purge runs, in seconds.
    #[serde(default = "default_retention_interval_seconds")]
    pub interval_seconds: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "scribe_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

fn default_db_path() -> String {
    "scribe.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_broker_kind() -> BrokerKind {
    BrokerKind::Log
}

fn default_broker_path() -> String {
    "scribe-broker.db".to_string()
}

fn default_partitions() -> u32 {
    4
}

fn default_broker_poll_interval_ms() -> u64 {
    100
}

fn default_kafka_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_message_timeout_ms() -> u64 {
    5_000
}

fn default_delivery_mode() -> DeliveryModeKind {
    DeliveryModeKind::Outbox
}

fn default_topic() -> String {
    scribe_types::DEFAULT_TOPIC.to_string()
}

fn default_batch_size() -> usize {
    50
}

fn default_relay_poll_interval_ms() -> u64 {
    500
}

fn default_lease_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    20
}

fn default_consumer_group() -> String {
    scribe_types::DEFAULT_CONSUMER_GROUP.to_string()
}

fn default_fetch_wait_ms() -> u64 {
    1_000
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_sent_retention_hours() -> u64 {
    24 * 7
}

fn default_retention_interval_seconds() -> u64 {
    3_600
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: default_broker_kind(),
            path: default_broker_path(),
            partitions: default_partitions(),
            poll_interval_ms: default_broker_poll_interval_ms(),
            brokers: default_kafka_brokers(),
            message_timeout_ms: default_message_timeout_ms(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            mode: default_delivery_mode(),
            topic: default_topic(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            embedded: false,
            batch_size: default_batch_size(),
            poll_interval_ms: default_relay_poll_interval_ms(),
            lease_ms: default_lease_ms(),
            max_attempts: default_max_attempts(),
            worker_id: None,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: default_consumer_group(),
            fetch_wait_ms: default_fetch_wait_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            partitions: None,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            sent_retention_hours: default_sent_retention_hours(),
            interval_seconds: default_retention_interval_seconds(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Config {
    /// Rejects values no component can run with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.batch_size == 0 {
            return Err(ConfigError::Invalid("relay.batch_size must be at least 1".into()));
        }
        if self.relay.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "relay.poll_interval_ms must be at least 1".into(),
            ));
        }
        if self.relay.lease_ms == 0 {
            return Err(ConfigError::Invalid("relay.lease_ms must be at least 1".into()));
        }
        // A publish that outlives the lease races a second relay.
        if self.relay.lease_ms <= self.broker.message_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "relay.lease_ms ({}) must exceed broker.message_timeout_ms ({})",
                self.relay.lease_ms, self.broker.message_timeout_ms
            )));
        }
        if self.relay.lease_ms <= self.database.busy_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "relay.lease_ms ({}) must exceed database.busy_timeout_ms ({})",
                self.relay.lease_ms, self.database.busy_timeout_ms
            )));
        }
        if self.broker.partitions == 0 {
            return Err(ConfigError::Invalid("broker.partitions must be at least 1".into()));
        }
        if self.delivery.topic.trim().is_empty() {
            return Err(ConfigError::Invalid("delivery.topic must not be empty".into()));
        }
        if self.consumer.group.trim().is_empty() {
            return Err(ConfigError::Invalid("consumer.group must not be empty".into()));
        }
        if let Some(assigned) = &self.consumer.partitions {
            let count = i64::from(self.broker.partitions);
            if assigned.is_empty() || assigned.iter().any(|p| !(0..count).contains(&i64::from(*p))) {
                return Err(ConfigError::Invalid(format!(
                    "consumer.partitions must be a non-empty subset of 0..{count}"
                )));
            }
        }
        Ok(())
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `SCRIBE_HOST`, `SCRIBE_PORT` override `server.host` / `server.port`
/// - `SCRIBE_DB_PATH` overrides `database.path`
/// - `SCRIBE_BROKER_KIND`, `SCRIBE_BROKER_PATH`, `SCRIBE_KAFKA_BROKERS`
///   override `broker.kind` / `broker.path` / `broker.brokers`
/// - `SCRIBE_DELIVERY_MODE`, `SCRIBE_TOPIC` override `delivery.mode` /
///   `delivery.topic`
/// - `SCRIBE_RELAY_EMBEDDED`, `SCRIBE_RELAY_BATCH_SIZE`,
///   `SCRIBE_RELAY_POLL_INTERVAL_MS`, `SCRIBE_RELAY_MAX_ATTEMPTS`,
///   `SCRIBE_WORKER_ID` override the matching `relay.*` keys
/// - `SCRIBE_CONSUMER_GROUP` overrides `consumer.group`
/// - `SCRIBE_LOG_LEVEL` overrides `logging.level`
/// - `SCRIBE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// Unparseable override values are ignored.
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if the resulting configuration is invalid.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Applies `SCRIBE_*` overrides read through `lookup`.
pub fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    fn flag(value: &str) -> bool {
        value == "true" || value == "1"
    }

    if let Some(parsed) = lookup("SCRIBE_HOST").and_then(|v| v.parse().ok()) {
        config.server.host = parsed;
    }
    if let Some(parsed) = lookup("SCRIBE_PORT").and_then(|v| v.parse().ok()) {
        config.server.port = parsed;
    }
    if let Some(db_path) = lookup("SCRIBE_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(kind) = lookup("SCRIBE_BROKER_KIND") {
        match kind.to_ascii_lowercase().as_str() {
            "memory" => config.broker.kind = BrokerKind::Memory,
            "log" => config.broker.kind = BrokerKind::Log,
            "kafka" => config.broker.kind = BrokerKind::Kafka,
            other => tracing::warn!(value = other, "ignoring unknown SCRIBE_BROKER_KIND"),
        }
    }
    if let Some(path) = lookup("SCRIBE_BROKER_PATH") {
        config.broker.path = path;
    }
    if let Some(brokers) = lookup("SCRIBE_KAFKA_BROKERS") {
        config.broker.brokers = brokers;
    }
    if let Some(mode) = lookup("SCRIBE_DELIVERY_MODE") {
        match mode.to_ascii_lowercase().as_str() {
            "outbox" => config.delivery.mode = DeliveryModeKind::Outbox,
            "direct" => config.delivery.mode = DeliveryModeKind::Direct,
            other => tracing::warn!(value = other, "ignoring unknown SCRIBE_DELIVERY_MODE"),
        }
    }
    if let Some(topic) = lookup("SCRIBE_TOPIC") {
        config.delivery.topic = topic;
    }
    if let Some(embedded) = lookup("SCRIBE_RELAY_EMBEDDED") {
        config.relay.embedded = flag(&embedded);
    }
    if let Some(parsed) = lookup("SCRIBE_RELAY_BATCH_SIZE").and_then(|v| v.parse().ok()) {
        config.relay.batch_size = parsed;
    }
    if let Some(parsed) = lookup("SCRIBE_RELAY_POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        config.relay.poll_interval_ms = parsed;
    }
    if let Some(parsed) = lookup("SCRIBE_RELAY_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
        config.relay.max_attempts = parsed;
    }
    if let Some(worker_id) = lookup("SCRIBE_WORKER_ID") {
        config.relay.worker_id = Some(worker_id);
    }
    if let Some(group) = lookup("SCRIBE_CONSUMER_GROUP") {
        config.consumer.group = group;
    }
    if let Some(level) = lookup("SCRIBE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("SCRIBE_LOG_JSON") {
        config.logging.json = flag(&json);
    }
}

/// Picks the config file path: first CLI argument, then
/// `SCRIBE_CONFIG_PATH`, then `config.toml`. Also returns where it came from.
pub fn resolve_config_path() -> (String, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (path, "cli-arg");
    }

    if let Ok(path) = std::env::var("SCRIBE_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (path, "env-var");
        }
    }

    ("config.toml".to_string(), "default")
}
