//! Pool configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: the `Default` implementations below
//! 2. **Config file**: TOML file named by the `LATTICE_CONFIG` env var
//!    (`config/lattice.toml` when unset)
//! 3. **Environment variables**: `LATTICE__*` vars override individual fields
//!
//! # Example
//!
//! ```toml
//! [pool]
//! chain_id = 1
//! selection_mode = "HighestHead"
//! poll_interval_ms = 10000
//!
//! [[nodes]]
//! name = "primary-a"
//! ws_url = "wss://eth-mainnet.example.com/ws"
//! http_url = "https://eth-mainnet.example.com"
//!
//! [[nodes]]
//! name = "broadcaster"
//! http_url = "https://tx-relay.example.com"
//! send_only = true
//! ```

use std::{collections::HashSet, fmt, path::Path, str::FromStr, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::{types::ChainId, upstream::backoff::BackoffConfig};

/// Node selection policy used by the pool for read dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SelectionMode {
    #[default]
    HighestHead,
    RoundRobin,
    TotalDifficulty,
    PriorityLevel,
}

impl SelectionMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HighestHead => "HighestHead",
            Self::RoundRobin => "RoundRobin",
            Self::TotalDifficulty => "TotalDifficulty",
            Self::PriorityLevel => "PriorityLevel",
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HighestHead" => Ok(Self::HighestHead),
            "RoundRobin" => Ok(Self::RoundRobin),
            "TotalDifficulty" => Ok(Self::TotalDifficulty),
            "PriorityLevel" => Ok(Self::PriorityLevel),
            other => Err(format!("unknown selection mode: {other}")),
        }
    }
}

/// Pool-wide health checking and dispatch settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Chain ID every node must report.
    pub chain_id: ChainId,

    #[serde(default)]
    pub selection_mode: SelectionMode,

    /// Best-node lease length in milliseconds. `0` disables lease switching.
    #[serde(default)]
    pub lease_duration_ms: u64,

    /// A node that produces no head for this long is marked out of sync. `0` disables the
    /// head subscription in the alive loop.
    #[serde(default = "default_no_new_heads_threshold_ms")]
    pub no_new_heads_threshold_ms: u64,

    /// Liveness poll period. `0` disables polling.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Consecutive poll failures before a node is declared unreachable. `0` disables polling.
    #[serde(default = "default_poll_failure_threshold")]
    pub poll_failure_threshold: u32,

    /// Blocks a node may trail the best live node before it is marked out of sync.
    #[serde(default = "default_sync_threshold")]
    pub sync_threshold: u32,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long `broadcast_transaction` keeps collecting results after the first one.
    #[serde(default = "default_send_tx_soft_timeout_ms")]
    pub send_tx_soft_timeout_ms: u64,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_no_new_heads_threshold_ms() -> u64 {
    180_000
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_poll_failure_threshold() -> u32 {
    5
}

fn default_sync_threshold() -> u32 {
    5
}

fn default_sweep_interval_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_send_tx_soft_timeout_ms() -> u64 {
    5_000
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            selection_mode: SelectionMode::default(),
            lease_duration_ms: 0,
            no_new_heads_threshold_ms: default_no_new_heads_threshold_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_failure_threshold: default_poll_failure_threshold(),
            sync_threshold: default_sync_threshold(),
            sweep_interval_ms: default_sweep_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            send_tx_soft_timeout_ms: default_send_tx_soft_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    #[must_use]
    pub fn no_new_heads_threshold(&self) -> Duration {
        Duration::from_millis(self.no_new_heads_threshold_ms)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn send_tx_soft_timeout(&self) -> Duration {
        Duration::from_millis(self.send_tx_soft_timeout_ms)
    }

    /// Reconnect backoff derived from the `backoff_*` fields.
    #[must_use]
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms),
            ..BackoffConfig::default()
        }
    }
}

/// One configured endpoint.
///
/// Primary nodes need a `ws_url`; the `http_url` becomes their secondary unary handle.
/// Send-only nodes need an `http_url` and ignore `ws_url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,

    #[serde(default)]
    pub ws_url: Option<String>,

    #[serde(default)]
    pub http_url: Option<String>,

    /// Priority tier for `PriorityLevel` selection and tie breaking. Lower is preferred.
    #[serde(default = "default_order")]
    pub order: i32,

    #[serde(default)]
    pub send_only: bool,
}

fn default_order() -> i32 {
    100
}

/// Prometheus recorder settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether to install the Prometheus recorder. Defaults to `true`.
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset. Defaults to `"info"`.
    pub level: String,

    /// Output format: `"json"` or `"pretty"`. Defaults to `"pretty"`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

/// Root configuration.
///
/// Environment overrides use the `LATTICE__` prefix with `__` as the nesting separator,
/// e.g. `LATTICE__POOL__SELECTION_MODE=RoundRobin`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatticeConfig {
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_environment() -> String {
    "development".to_string()
}

impl Default for LatticeConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            pool: PoolConfig::default(),
            nodes: Vec::new(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl LatticeConfig {
    /// Loads configuration from a TOML file with environment variable overrides.
    ///
    /// A missing file is not an error; defaults and environment overrides still apply.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be parsed or the merged result cannot be
    /// deserialized.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let defaults = PoolConfig::default();
        let config_builder = Config::builder()
            .set_default("environment", default_environment())?
            .set_default("pool.chain_id", defaults.chain_id)?
            .set_default("pool.selection_mode", defaults.selection_mode.as_str())?
            .set_default("pool.lease_duration_ms", defaults.lease_duration_ms)?
            .set_default("pool.no_new_heads_threshold_ms", defaults.no_new_heads_threshold_ms)?
            .set_default("pool.poll_interval_ms", defaults.poll_interval_ms)?
            .set_default("pool.poll_failure_threshold", defaults.poll_failure_threshold)?
            .set_default("pool.sync_threshold", defaults.sync_threshold)?
            .set_default("pool.sweep_interval_ms", defaults.sweep_interval_ms)?
            .set_default("pool.request_timeout_ms", defaults.request_timeout_ms)?
            .set_default("pool.send_tx_soft_timeout_ms", defaults.send_tx_soft_timeout_ms)?
            .set_default("pool.backoff_base_ms", defaults.backoff_base_ms)?
            .set_default("pool.backoff_max_ms", defaults.backoff_max_ms)?
            .set_default("metrics.enabled", true)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(
                Environment::with_prefix("LATTICE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config_builder.try_deserialize()
    }

    /// Loads configuration from `LATTICE_CONFIG`, falling back to `config/lattice.toml`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("LATTICE_CONFIG").unwrap_or_else(|_| "config/lattice.toml".to_string());
        Self::from_file(&config_path)
    }

    pub fn primary_nodes(&self) -> impl Iterator<Item = &NodeConfig> {
        self.nodes.iter().filter(|n| !n.send_only)
    }

    pub fn send_only_nodes(&self) -> impl Iterator<Item = &NodeConfig> {
        self.nodes.iter().filter(|n| n.send_only)
    }

    /// Validates the configuration for correctness and consistency.
    ///
    /// # Errors
    ///
    /// Returns a descriptive error string for the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.primary_nodes().next().is_none() {
            return Err("No primary RPC nodes configured".to_string());
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                return Err("Node name must not be empty".to_string());
            }
            if !names.insert(node.name.as_str()) {
                return Err(format!("Duplicate node name: {}", node.name));
            }

            if node.send_only {
                match &node.http_url {
                    None => {
                        return Err(format!("Send-only node {} requires an http_url", node.name))
                    }
                    Some(url) if !url.starts_with("http") => {
                        return Err(format!("Invalid HTTP URL for node {}: {}", node.name, url))
                    }
                    Some(_) => {}
                }
                continue;
            }

            match &node.ws_url {
                None => return Err(format!("Primary node {} requires a ws_url", node.name)),
                Some(url) if !url.starts_with("ws") => {
                    return Err(format!("Invalid WebSocket URL for node {}: {}", node.name, url))
                }
                Some(_) => {}
            }
            if let Some(url) = &node.http_url {
                if !url.starts_with("http") {
                    return Err(format!("Invalid HTTP URL for node {}: {}", node.name, url));
                }
            }
        }

        if self.pool.sweep_interval_ms == 0 {
            return Err("Sweep interval must be greater than 0".to_string());
        }

        if self.pool.request_timeout_ms == 0 {
            return Err("Request timeout must be greater than 0".to_string());
        }

        if self.pool.backoff_base_ms == 0 || self.pool.backoff_max_ms < self.pool.backoff_base_ms {
            return Err("Backoff max must be at least the non-zero backoff base".to_string());
        }

        if !["json", "pretty"].contains(&self.logging.format.as_str()) {
            return Err("Logging format must be 'json' or 'pretty'".to_string());
        }

        Ok(())
    }
}
