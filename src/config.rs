//! Configuration management for windward.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for the windward library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindwardConfig {
    /// Shared-store (Redis) connection settings
    #[serde(default)]
    pub redis: RedisConfig,

    /// Optional path to a resource limits file (YAML)
    #[serde(default)]
    pub limits_path: Option<String>,
}

impl Default for WindwardConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            limits_path: None,
        }
    }
}

/// Connection settings for the Redis-backed store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis host
    #[serde(default = "default_host")]
    pub host: String,

    /// Redis port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Logical database index
    #[serde(default)]
    pub db: i64,

    /// Prefix applied to every key the store writes
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-operation timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub operation_timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db: 0,
            key_prefix: default_key_prefix(),
            operation_timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    "rate_limiter:".to_string()
}

fn default_timeout_secs() -> u64 {
    5
}

impl RedisConfig {
    /// Build a configuration from the `REDIS_HOST`, `REDIS_PORT`, and
    /// `REDIS_DB` environment variables, falling back to defaults for any
    /// that are unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(host) = std::env::var("REDIS_HOST") {
            if !host.is_empty() {
                config.host = host;
            }
        }
        if let Ok(port) = std::env::var("REDIS_PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        if let Ok(db) = std::env::var("REDIS_DB") {
            if let Ok(db) = db.parse() {
                config.db = db;
            }
        }
        config
    }

    /// Connection URL in the form `redis://host:port/db`.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }

    /// Per-operation timeout as a [`Duration`].
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl WindwardConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WindwardConfig = serde_yaml::from_str(&contents)
            .map_err(|e| crate::error::WindwardError::Config(e.to_string()))?;
        Ok(config)
    }
}
