//! Configuration module for the tierflow pipeline.
//!
//! This module provides configuration structures for connecting to NATS,
//! describing the per-tier routing tables, tuning the router loop and
//! setting up telemetry. Values are layered with the `config` crate:
//! defaults, then optional files, then `TIERFLOW__*` environment variables.

use crate::tier::Tier;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(String),
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::LoadError(e.to_string())
    }
}

/// NATS connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// Server URL, e.g. `nats://localhost:4222`
    #[serde(default = "default_nats_url")]
    pub url: String,
    /// Client name reported to the server
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Token authentication
    pub token: Option<String>,
    /// User/password authentication
    pub username: Option<String>,
    pub password: Option<String>,
    /// Path to a `.creds` file (JWT + nkey)
    pub credentials_file: Option<String>,
    /// Connection timeout in milliseconds
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Request timeout for JetStream API calls in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_client_name() -> String {
    "tierflow".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    10000
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
            client_name: default_client_name(),
            token: None,
            username: None,
            password: None,
            credentials_file: None,
            connection_timeout_ms: default_connection_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl NatsConfig {
    /// Create a new NatsConfig for the given server URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Build async-nats connect options from this configuration
    pub async fn connect_options(&self) -> Result<async_nats::ConnectOptions, ConfigError> {
        let mut options = match self.credentials_file {
            Some(ref path) => async_nats::ConnectOptions::with_credentials_file(path)
                .await
                .map_err(|e| ConfigError::invalid("nats.credentials_file", e.to_string()))?,
            None => async_nats::ConnectOptions::new(),
        };

        if let Some(ref token) = self.token {
            options = options.token(token.clone());
        }
        if let (Some(ref username), Some(ref password)) = (&self.username, &self.password) {
            options = options.user_and_password(username.clone(), password.clone());
        }

        Ok(options
            .name(&self.client_name)
            .connection_timeout(self.connection_timeout())
            .request_timeout(Some(self.request_timeout())))
    }
}

/// Per-tier worker tuning: visibility timeout, fetch batch and redelivery limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTuning {
    /// Ack wait (visibility timeout) and fetch timeout in seconds
    pub ack_wait_secs: u64,
    /// Messages fetched per pull
    pub batch_size: usize,
    /// Maximum unacknowledged messages per consumer
    pub max_ack_pending: i64,
    /// Maximum delivery attempts before the message is dead-lettered
    pub max_deliver: i64,
}

impl WorkerTuning {
    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }
}

/// Autoscaling policy read by the external autoscaler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub messages_per_replica: u32,
    pub cooldown_period_secs: u64,
}

/// Subject/stream/consumer triple plus policy for one tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub subject: String,
    pub stream: String,
    pub consumer: String,
    /// Stream retention in hours
    pub retention_hours: u64,
    /// Maximum consumers on the tier stream
    pub max_consumers: i32,
    pub worker: WorkerTuning,
    pub scaling: ScalingPolicy,
}

fn default_small_tier() -> TierConfig {
    TierConfig {
        subject: "storage.events.small".to_string(),
        stream: "STORAGE_EVENTS_SMALL".to_string(),
        consumer: "small-workers".to_string(),
        retention_hours: 24,
        max_consumers: 50,
        worker: WorkerTuning {
            ack_wait_secs: 300,
            batch_size: 10,
            max_ack_pending: 100,
            max_deliver: 3,
        },
        scaling: ScalingPolicy {
            min_replicas: 2,
            max_replicas: 50,
            messages_per_replica: 10,
            cooldown_period_secs: 30,
        },
    }
}

fn default_medium_tier() -> TierConfig {
    TierConfig {
        subject: "storage.events.medium".to_string(),
        stream: "STORAGE_EVENTS_MEDIUM".to_string(),
        consumer: "medium-workers".to_string(),
        retention_hours: 24,
        max_consumers: 20,
        worker: WorkerTuning {
            ack_wait_secs: 600,
            batch_size: 5,
            max_ack_pending: 50,
            max_deliver: 3,
        },
        scaling: ScalingPolicy {
            min_replicas: 1,
            max_replicas: 20,
            messages_per_replica: 5,
            cooldown_period_secs: 60,
        },
    }
}

fn default_large_tier() -> TierConfig {
    TierConfig {
        subject: "storage.events.large".to_string(),
        stream: "STORAGE_EVENTS_LARGE".to_string(),
        consumer: "large-workers".to_string(),
        retention_hours: 48,
        max_consumers: 5,
        worker: WorkerTuning {
            ack_wait_secs: 1800,
            batch_size: 1,
            max_ack_pending: 10,
            max_deliver: 2,
        },
        scaling: ScalingPolicy {
            min_replicas: 0,
            max_replicas: 5,
            messages_per_replica: 1,
            cooldown_period_secs: 120,
        },
    }
}

/// One entry per tier. An absent tier falls back to its default entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierTableConfig {
    #[serde(default = "default_small_tier")]
    pub small: TierConfig,
    #[serde(default = "default_medium_tier")]
    pub medium: TierConfig,
    #[serde(default = "default_large_tier")]
    pub large: TierConfig,
}

impl Default for TierTableConfig {
    fn default() -> Self {
        Self {
            small: default_small_tier(),
            medium: default_medium_tier(),
            large: default_large_tier(),
        }
    }
}

impl TierTableConfig {
    pub fn get(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::Small => &self.small,
            Tier::Medium => &self.medium,
            Tier::Large => &self.large,
        }
    }
}

/// The generic ingestion subject and the router's shared durable consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    #[serde(default = "default_ingestion_subject")]
    pub subject: String,
    #[serde(default = "default_ingestion_stream")]
    pub stream: String,
    #[serde(default = "default_router_consumer")]
    pub consumer: String,
    #[serde(default = "default_ingestion_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_ingestion_max_consumers")]
    pub max_consumers: i32,
    #[serde(default = "default_router_tuning")]
    pub tuning: WorkerTuning,
}

fn default_ingestion_subject() -> String {
    "storage.events".to_string()
}

fn default_ingestion_stream() -> String {
    "STORAGE_EVENTS".to_string()
}

fn default_router_consumer() -> String {
    "tiered-storage-router".to_string()
}

fn default_ingestion_retention_hours() -> u64 {
    24
}

fn default_ingestion_max_consumers() -> i32 {
    10
}

fn default_router_tuning() -> WorkerTuning {
    WorkerTuning {
        ack_wait_secs: 60,
        batch_size: 1,
        max_ack_pending: 200,
        max_deliver: 5,
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            subject: default_ingestion_subject(),
            stream: default_ingestion_stream(),
            consumer: default_router_consumer(),
            retention_hours: default_ingestion_retention_hours(),
            max_consumers: default_ingestion_max_consumers(),
            tuning: default_router_tuning(),
        }
    }
}

/// Size thresholds and routing tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Largest size (inclusive) routed to the small tier
    #[serde(default = "default_small_max_bytes")]
    pub small_max_bytes: u64,
    /// Largest size (inclusive) routed to the medium tier
    #[serde(default = "default_medium_max_bytes")]
    pub medium_max_bytes: u64,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub tiers: TierTableConfig,
}

fn default_small_max_bytes() -> u64 {
    100 * 1024 * 1024 // 100MB
}

fn default_medium_max_bytes() -> u64 {
    1024 * 1024 * 1024 // 1GB
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            small_max_bytes: default_small_max_bytes(),
            medium_max_bytes: default_medium_max_bytes(),
            ingestion: IngestionConfig::default(),
            tiers: TierTableConfig::default(),
        }
    }
}

/// Router loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    /// Bounded wait for each pull in seconds
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Upper bound for the backoff after consecutive pull failures
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Interval between stale consumer sweeps
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Interval between status log lines
    #[serde(default = "default_status_log_interval_secs")]
    pub status_log_interval_secs: u64,
    /// Value written to `routing.routed_by`
    #[serde(default = "default_routed_by")]
    pub routed_by: String,
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_max_backoff_secs() -> u64 {
    30
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_status_log_interval_secs() -> u64 {
    60
}

fn default_routed_by() -> String {
    "tiered-storage-router".to_string()
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            status_log_interval_secs: default_status_log_interval_secs(),
            routed_by: default_routed_by(),
        }
    }
}

impl RouterSettings {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn status_log_interval(&self) -> Duration {
        Duration::from_secs(self.status_log_interval_secs)
    }
}

/// Logging and metrics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

/// Top-level configuration for the router process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub router: RouterSettings,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl PipelineConfig {
    /// Load configuration from config files and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/pipeline").required(false))
            .add_source(config::File::with_name("/etc/tierflow/pipeline").required(false))
            // TIERFLOW__NATS__URL -> nats.url
            .add_source(
                config::Environment::with_prefix("TIERFLOW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nats.url.is_empty() {
            return Err(ConfigError::MissingRequired("nats.url".to_string()));
        }
        if self.router.fetch_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "router.fetch_timeout_secs",
                "must be greater than zero",
            ));
        }
        crate::tier::RoutingTable::validate(&self.routing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.nats.url, "nats://localhost:4222");
        assert_eq!(config.routing.ingestion.subject, "storage.events");
        assert_eq!(config.routing.ingestion.consumer, "tiered-storage-router");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tier_table_lookup() {
        let tiers = TierTableConfig::default();
        assert_eq!(tiers.get(Tier::Small).consumer, "small-workers");
        assert_eq!(tiers.get(Tier::Large).worker.batch_size, 1);
        assert_eq!(tiers.get(Tier::Medium).worker.ack_wait(), Duration::from_secs(600));
    }

    #[test]
    fn test_partial_routing_config_fills_defaults() {
        let json = r#"{ "small_max_bytes": 1024, "medium_max_bytes": 4096 }"#;
        let routing: RoutingConfig = serde_json::from_str(json).unwrap();
        assert_eq!(routing.small_max_bytes, 1024);
        assert_eq!(routing.tiers.medium.stream, "STORAGE_EVENTS_MEDIUM");
        assert_eq!(routing.ingestion.tuning.max_deliver, 5);
    }

    #[test]
    fn test_invalid_fetch_timeout() {
        let mut config = PipelineConfig::default();
        config.router.fetch_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
