use crate::worker::{TenantScope, WorkerSettings};
use anyhow::Context;
use serde::Deserialize;
use std::time::Duration;
use tierflow_pipeline::{NatsConfig, RoutingConfig, RoutingTable, TelemetryConfig, Tier};

/// Main configuration for the storage worker service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// NATS connection
    #[serde(default)]
    pub nats: NatsConfig,
    /// Size thresholds and per-tier tables, shared with the router
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Logging and metrics
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Worker pool configuration
    #[serde(default)]
    pub worker: WorkerConfig,
    /// S3 configuration
    #[serde(default)]
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Tiers served by this process
    #[serde(default = "default_tiers")]
    pub tiers: Vec<Tier>,
    /// Restrict this process to one tenant (tenant-sharded deployments)
    pub tenant_id: Option<String>,
    /// A worker is unhealthy when neither a message nor a loop heartbeat
    /// was seen within this window
    #[serde(default = "default_liveness_window_secs")]
    pub liveness_window_secs: u64,
    /// Upper bound for the backoff after consecutive pull failures
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Longest wait for one batch pull
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

/// S3-compatible object store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Read every object from this bucket, keyed by its full path. When
    /// unset, the tenant id is the bucket and the relative path the key.
    pub bucket: Option<String>,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for SeaweedFS, MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO and SeaweedFS)
    #[serde(default)]
    pub force_path_style: bool,
    /// Objects larger than this are indexed without content extraction
    #[serde(default = "default_max_extract_bytes")]
    pub max_extract_bytes: u64,
    /// Characters per text chunk resource
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in each worker's pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in each worker's pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// API configuration for the status and health endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty means any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_tiers() -> Vec<Tier> {
    Tier::ALL.to_vec()
}

fn default_liveness_window_secs() -> u64 {
    300
}

fn default_max_backoff_secs() -> u64 {
    30
}

fn default_fetch_timeout_secs() -> u64 {
    5
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_extract_bytes() -> u64 {
    256 * 1024 * 1024 // 256MB
}

fn default_chunk_chars() -> usize {
    4000
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            tenant_id: None,
            liveness_window_secs: default_liveness_window_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: None,
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            max_extract_bytes: default_max_extract_bytes(),
            chunk_chars: default_chunk_chars(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: false,
            cors_origins: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("database.url", "postgres://localhost/tierflow")?
            // Add config file if present
            .add_source(config::File::with_name("config/storage").required(false))
            .add_source(config::File::with_name("/etc/tierflow/storage").required(false))
            // Override with environment variables
            // TIERFLOW__DATABASE__URL -> database.url
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
    pub fn validate(&self) -> anyhow::Result<()> {
        RoutingTable::validate(&self.routing).context("Invalid routing configuration")?;
        if self.worker.tiers.is_empty() {
            anyhow::bail!("worker.tiers must name at least one tier");
        }
        if self.worker.liveness_window_secs == 0 {
            anyhow::bail!("worker.liveness_window_secs must be greater than zero");
        }
        if self.worker.fetch_timeout_secs == 0 {
            anyhow::bail!("worker.fetch_timeout_secs must be greater than zero");
        }
        if self.s3.chunk_chars == 0 {
            anyhow::bail!("s3.chunk_chars must be greater than zero");
        }
        Ok(())
    }

    /// Get the worker liveness window as Duration
    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.worker.liveness_window_secs)
    }

    /// Get the maximum pull backoff as Duration
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.worker.max_backoff_secs)
    }

    /// Loop timing for the tier workers
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            fetch_timeout: Duration::from_secs(self.worker.fetch_timeout_secs),
            max_backoff: self.max_backoff(),
            liveness_window: self.liveness_window(),
        }
    }

    pub fn tenant_scope(&self) -> TenantScope {
        TenantScope::from_option(self.worker.tenant_id.clone())
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        serde_json::from_value(serde_json::json!({
            "database": { "url": "postgres://localhost/test" }
        }))
        .unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = minimal();
        assert_eq!(config.worker.tiers, vec![Tier::Small, Tier::Medium, Tier::Large]);
        assert_eq!(config.worker.liveness_window_secs, 300);
        assert_eq!(config.s3.region, "us-east-1");
        assert!(config.s3.bucket.is_none());
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.routing.ingestion.consumer, "tiered-storage-router");
        assert_eq!(config.database.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.database.idle_timeout(), Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tier_list_from_strings() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "worker": { "tiers": ["large"], "tenant_id": "tenant-1" },
            "s3": { "bucket": "files" },
            "database": { "url": "postgres://localhost/test" }
        }))
        .unwrap();
        assert_eq!(config.worker.tiers, vec![Tier::Large]);
        assert_eq!(config.worker.tenant_id.as_deref(), Some("tenant-1"));
        assert_eq!(config.tenant_scope(), TenantScope::Tenant("tenant-1".to_string()));
        assert_eq!(config.worker_settings().fetch_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_empty_tiers() {
        let mut config = minimal();
        config.worker.tiers.clear();
        assert!(config.validate().is_err());
    }
}
