//! Configuration management for the guard service.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{GuardError, Result};
use crate::retry::RetryPolicy;

/// Prefix for environment overrides, e.g. `PIXELIFT_SERVER__HTTP_ADDR`.
pub const ENV_PREFIX: &str = "PIXELIFT";

/// Main configuration for the guard service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Concurrency guard configuration
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// API keys loaded into the in-memory repository at startup
    #[serde(default)]
    pub api_keys: Vec<SeedApiKey>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Which backing store holds the counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Counters live in this process
    #[default]
    Memory,
    /// Counters live in Redis and are shared between processes
    Redis(RedisStoreConfig),
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://localhost:6379`
    pub url: String,

    /// Prefix applied to every key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Retry policy for the initial connection
    #[serde(default = "default_connect_retry")]
    pub connect_retry: RetryPolicy,

    /// Upper bound for a single command, in milliseconds; a command that
    /// takes longer counts as a store failure
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: default_key_prefix(),
            connect_retry: default_connect_retry(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

impl RedisStoreConfig {
    /// Per-command timeout.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms.max(1))
    }
}

fn default_key_prefix() -> String {
    "pixelift:".to_string()
}

fn default_response_timeout_ms() -> u64 {
    1_000
}

fn default_connect_retry() -> RetryPolicy {
    RetryPolicy {
        timeout_ms: 2_000,
        max_retries: 3,
        backoff_ms: 500,
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Named limiter overrides; the `auth`, `api` and `polling` presets
    /// apply for any name not listed here
    #[serde(default)]
    pub limiters: BTreeMap<String, LimiterConfig>,

    /// How often expired in-memory counters are purged, in seconds
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            limiters: BTreeMap::new(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

fn default_purge_interval() -> u64 {
    60
}

/// Configuration for one named limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Requests admitted per window
    pub max_requests: u64,
}

/// Concurrency guard configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// In-flight jobs allowed per key unless the key carries its own limit
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u64,

    /// Safety expiry refreshed on every increment, in seconds
    #[serde(default = "default_safety_ttl")]
    pub safety_ttl_secs: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            safety_ttl_secs: default_safety_ttl(),
        }
    }
}

fn default_max_in_flight() -> u64 {
    3
}

fn default_safety_ttl() -> u64 {
    600
}

/// An API key provisioned through configuration. Only the hash is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedApiKey {
    /// Owner of the key
    pub user_id: String,
    /// Display name
    pub name: String,
    /// SHA-256 hex digest of the full key
    pub key_hash: String,
    /// First characters of the key, for display
    #[serde(default)]
    pub prefix: String,
    /// Per-key in-flight job limit
    #[serde(default)]
    pub max_concurrent_jobs: Option<u64>,
    /// Whether the key is accepted
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl GuardConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| GuardError::Config(e.to_string()))
    }

    /// Load configuration from an optional YAML file, overlaid with
    /// `PIXELIFT_`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
