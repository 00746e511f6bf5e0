use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::store::DEFAULT_HWM_WINDOW_EPOCHS;

/// Top-level configuration for the latency indexer.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Solana RPC connection, used as the epoch oracle.
    #[serde(default)]
    pub solana: SolanaConfig,

    /// Telemetry gateway connection.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Topology directory connection.
    #[serde(default)]
    pub serviceability: ServiceabilityConfig,

    /// ClickHouse connection configuration.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Refresh scheduling and fan-out configuration.
    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Solana RPC connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SolanaConfig {
    /// JSON-RPC URL (e.g., "https://api.mainnet-beta.solana.com").
    #[serde(default)]
    pub rpc_url: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Telemetry gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Gateway HTTP endpoint (e.g., "http://localhost:8080").
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Topology directory configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceabilityConfig {
    /// Directory HTTP endpoint.
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Refresh scheduling and fan-out configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Time between refresh cycles. Default: 1m.
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Maximum in-flight remote fetches per cycle. Default: 32.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Recent epochs scanned for high-water marks. Default: 2.
    #[serde(default = "default_hwm_window_epochs")]
    pub hwm_window_epochs: u64,

    /// Internet data providers whose collector streams are indexed.
    #[serde(default)]
    pub data_providers: Vec<String>,

    /// Public key of the internet latency collector agent.
    #[serde(default)]
    pub internet_agent_pk: String,

    /// Device-link refresh toggle.
    #[serde(default)]
    pub device_link: KindConfig,

    /// Internet-metro refresh toggle.
    #[serde(default)]
    pub internet_metro: KindConfig,
}

/// Per circuit kind toggle.
#[derive(Debug, Clone, Deserialize)]
pub struct KindConfig {
    /// Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_database() -> String {
    "default".to_string()
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_concurrency() -> usize {
    32
}

fn default_hwm_window_epochs() -> u64 {
    DEFAULT_HWM_WINDOW_EPOCHS
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            solana: SolanaConfig::default(),
            telemetry: TelemetryConfig::default(),
            serviceability: ServiceabilityConfig::default(),
            clickhouse: ClickHouseConfig::default(),
            refresh: RefreshConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for SolanaConfig {
    fn default() -> Self {
        Self {
            rpc_url: String::new(),
            timeout: default_request_timeout(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_request_timeout(),
        }
    }
}

impl Default for ServiceabilityConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_request_timeout(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: default_refresh_interval(),
            max_concurrency: default_max_concurrency(),
            hwm_window_epochs: default_hwm_window_epochs(),
            data_providers: Vec::new(),
            internet_agent_pk: String::new(),
            device_link: KindConfig::default(),
            internet_metro: KindConfig::default(),
        }
    }
}

impl Default for KindConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.solana.rpc_url.is_empty() {
            bail!("solana.rpc_url is required");
        }

        if self.telemetry.endpoint.is_empty() {
            bail!("telemetry.endpoint is required");
        }

        if self.serviceability.endpoint.is_empty() {
            bail!("serviceability.endpoint is required");
        }

        if self.clickhouse.endpoint.is_empty() {
            bail!("clickhouse.endpoint is required");
        }

        self.refresh.validate()
    }
}

impl RefreshConfig {
    /// Validate the refresh section on its own.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            bail!("refresh.interval must be positive");
        }

        if self.max_concurrency == 0 {
            bail!("refresh.max_concurrency must be positive");
        }

        if self.hwm_window_epochs == 0 {
            bail!("refresh.hwm_window_epochs must be positive");
        }

        if !self.device_link.enabled && !self.internet_metro.enabled {
            bail!("at least one of refresh.device_link or refresh.internet_metro must be enabled");
        }

        if self.internet_metro.enabled {
            if self.data_providers.is_empty() {
                bail!("refresh.data_providers must not be empty when internet_metro is enabled");
            }

            if self.data_providers.iter().any(|p| p.trim().is_empty()) {
                bail!("refresh.data_providers must not contain empty names");
            }

            if self.internet_agent_pk.is_empty() {
                bail!("refresh.internet_agent_pk is required when internet_metro is enabled");
            }
        }

        Ok(())
    }
}
