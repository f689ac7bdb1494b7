//! Configuration management for the keyrate service.
//!
//! Service settings come from an optional YAML/JSON/TOML file overlaid with
//! `KEYRATE__SECTION__FIELD` environment variables. Rate limit rules live in
//! their own file, see [`crate::ratelimit::KeyRateConfig`].

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{KeyrateError, Result};
use crate::ratelimit::{LimiterSettings, DEFAULT_MAX_ATTEMPTS};

/// Main configuration for the keyrate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyrateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Path to the rate limit rules file
    pub rules_path: Option<String>,

    /// Number of isolated workers sharing the store
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Refill tick period in milliseconds
    #[serde(default = "default_refill_tick_ms")]
    pub refill_tick_ms: u64,

    /// Compare-and-swap attempts per token decrement
    #[serde(default = "default_max_consume_attempts")]
    pub max_consume_attempts: u32,

    /// How often to re-read the rules file, in seconds; 0 disables reloading
    #[serde(default)]
    pub reload_interval_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            workers: default_workers(),
            refill_tick_ms: default_refill_tick_ms(),
            max_consume_attempts: default_max_consume_attempts(),
            reload_interval_secs: 0,
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_refill_tick_ms() -> u64 {
    500
}

fn default_max_consume_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl LimiterConfig {
    pub fn refill_tick(&self) -> Duration {
        Duration::from_millis(self.refill_tick_ms.max(1))
    }

    pub fn reload_interval(&self) -> Option<Duration> {
        (self.reload_interval_secs > 0).then(|| Duration::from_secs(self.reload_interval_secs))
    }

    pub fn settings(&self) -> LimiterSettings {
        LimiterSettings {
            max_consume_attempts: self.max_consume_attempts,
        }
    }
}

impl KeyrateConfig {
    /// Load configuration from an optional file plus `KEYRATE__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder
            .add_source(
                config::Environment::with_prefix("KEYRATE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| KeyrateError::Config(e.to_string()))
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(path))
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.workers == 0 {
            return Err(KeyrateError::Config("limiter.workers must be at least 1".to_string()));
        }
        if self.limiter.rules_path.is_none() {
            return Err(KeyrateError::Config("limiter.rules_path is required".to_string()));
        }
        Ok(())
    }
}
