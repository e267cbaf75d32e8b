//! Process configuration.
//!
//! Settings come from an optional TOML file and from environment variables
//! (`DATABASE_URI`, `ACCRUAL_SYSTEM_ADDRESS`, `BATCH_SIZE`, ...), the latter
//! taking precedence.

use crate::error::Result;
use ::config::{ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default number of orders per reconciliation batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default delay between reconciliation passes.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default bound on a single oracle request.
pub const DEFAULT_ORACLE_TIMEOUT_MS: u64 = 5000;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_oracle_timeout_ms() -> u64 {
    DEFAULT_ORACLE_TIMEOUT_MS
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// PostgreSQL connection string.
    pub database_uri: String,

    /// Base URL of the accrual oracle.
    pub accrual_system_address: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_oracle_timeout_ms")]
    pub oracle_timeout_ms: u64,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Config {
    /// Loads configuration from `path` (if given) overlaid with the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::build(path, Some(Environment::default().try_parsing(true)))
    }

    fn build(path: Option<&Path>, env: Option<Environment>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        if let Some(env) = env {
            builder = builder.add_source(env);
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()
    }

    fn validate(self) -> Result<Self> {
        if self.batch_size == 0 {
            return Err(ConfigError::Message("batch_size must be at least 1".into()).into());
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Message("poll_interval_ms must be at least 1".into()).into());
        }
        if self.accrual_system_address.trim().is_empty() {
            return Err(ConfigError::Message("accrual_system_address is empty".into()).into());
        }
        Ok(self)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms)
    }
}
