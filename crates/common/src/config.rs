//! Configuration structures for Handoff
//!
//! Configuration is layered: built-in defaults, an optional YAML file, then
//! `HANDOFF__*` environment variables. The binary applies CLI flags on top.

use crate::error::{Result, RouterError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `HANDOFF__PORT=9000`
pub const ENV_PREFIX: &str = "HANDOFF";

/// Top-level configuration for the decode router
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Server binding address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Base URLs of the decode workers
    #[serde(default)]
    pub worker_urls: Vec<String>,

    /// Worker selection policy
    #[serde(default)]
    pub selection: SelectionConfig,

    /// Reservation lease configuration
    #[serde(default)]
    pub reservation: ReservationConfig,

    /// Decode worker client configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Worker selection configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// How equal loads are ordered
    #[serde(default)]
    pub tie_break: TieBreak,
}

/// Ordering among workers with the same load
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Earliest position in the configured worker list
    #[default]
    FirstRegistered,

    /// Lexicographically smallest worker id
    LowestId,
}

impl fmt::Display for TieBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TieBreak::FirstRegistered => f.write_str("first_registered"),
            TieBreak::LowestId => f.write_str("lowest_id"),
        }
    }
}

impl FromStr for TieBreak {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "first_registered" => Ok(TieBreak::FirstRegistered),
            "lowest_id" => Ok(TieBreak::LowestId),
            other => Err(RouterError::config(format!("Unknown tie-break policy: {}", other))),
        }
    }
}

/// Reservation lease configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationConfig {
    /// Lease lifetime in seconds; unclaimed reservations are released after this
    #[serde(default = "default_reservation_ttl")]
    pub ttl_secs: u64,

    /// How often expired leases are swept, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_reservation_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Decode worker client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Total timeout for a generate call in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of the human-readable format
    #[serde(default)]
    pub structured_logging: bool,

    /// Expose Prometheus metrics on /metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            structured_logging: false,
            enable_metrics: default_metrics(),
        }
    }
}

/// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_reservation_ttl() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    1800
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            worker_urls: Vec::new(),
            selection: SelectionConfig::default(),
            reservation: ReservationConfig::default(),
            upstream: UpstreamConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Split a comma-separated worker list, dropping blank entries
pub fn parse_worker_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(normalize_worker_url)
        .filter(|url| !url.is_empty())
        .collect()
}

/// Trim whitespace and trailing slashes so `{url}/generate` is well formed
pub fn normalize_worker_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

impl RouterConfig {
    /// Load configuration from defaults, an optional YAML file and the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, environment())
    }

    /// Load configuration with an explicit environment source
    pub fn load_with_env(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: RouterConfig = builder.add_source(env).build()?.try_deserialize()?;
        Ok(config)
    }

    /// Worker addresses after normalization, in configured order
    pub fn worker_addresses(&self) -> Vec<String> {
        self.worker_urls
            .iter()
            .map(|url| normalize_worker_url(url))
            .filter(|url| !url.is_empty())
            .collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let workers = self.worker_addresses();
        if workers.is_empty() {
            return Err(RouterError::config("At least one decode worker URL is required"));
        }

        let mut seen = HashSet::new();
        for url in &workers {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(RouterError::config(format!(
                    "Worker URL must start with http:// or https://: {}",
                    url
                )));
            }
            if !seen.insert(url.as_str()) {
                return Err(RouterError::config(format!("Duplicate worker URL: {}", url)));
            }
        }

        if self.reservation.ttl_secs == 0 {
            return Err(RouterError::config("reservation.ttl_secs must be positive"));
        }
        if self.reservation.sweep_interval_secs == 0 {
            return Err(RouterError::config("reservation.sweep_interval_secs must be positive"));
        }
        if self.upstream.request_timeout_secs == 0 || self.upstream.connect_timeout_secs == 0 {
            return Err(RouterError::config("upstream timeouts must be positive"));
        }

        Ok(())
    }

    /// Get reservation lease lifetime as Duration
    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation.ttl_secs)
    }

    /// Get lease sweep interval as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.reservation.sweep_interval_secs)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.request_timeout_secs)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.connect_timeout_secs)
    }
}

/// Environment source for `HANDOFF__*` overrides
pub fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("worker_urls")
        .try_parsing(true)
}
