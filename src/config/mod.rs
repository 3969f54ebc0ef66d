//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`FLEET_*`)
//! - CLI arguments (for the `fleet` binary)

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Protocol engine configuration
    #[serde(default)]
    pub agency: AgencyConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| FleetError::Config(format!("Failed to read {}: {e}", path.display())))?;

        toml::from_str(&content)
            .map_err(|e| FleetError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load from `path`, else the default config file if present, else
    /// defaults; environment variables override either way.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(path)?,
                _ => Self::default(),
            },
        };
        config.apply_env();
        Ok(config)
    }

    /// `<config dir>/fleet/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("fleet").join("config.toml"))
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| FleetError::Config(e.to_string()))
    }

    fn apply_env(&mut self) {
        if let Ok(shard) = std::env::var("FLEET_SHARD") {
            self.agency.shard = shard;
        }
        env_parse("FLEET_ANNOUNCE_TIMEOUT_SECS", &mut self.agency.announce_timeout_secs);
        env_parse("FLEET_GRANT_TIMEOUT_SECS", &mut self.agency.grant_timeout_secs);
        env_parse("FLEET_REQUEST_TIMEOUT_SECS", &mut self.agency.request_timeout_secs);
        env_parse("FLEET_MAX_RETRIES", &mut self.agency.retry.max_retries);
        if let Ok(level) = std::env::var("FLEET_LOG") {
            self.logging.level = level;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(val) = std::env::var(name) {
        match val.parse() {
            Ok(val) => *slot = val,
            Err(_) => tracing::warn!(variable = name, value = %val, "Ignoring unparsable value"),
        }
    }
}

/// Protocol timeouts and limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgencyConfig {
    /// Shard this agency's agent lives in
    pub shard: String,

    /// Manager: how long bids are collected
    pub announce_timeout_secs: u64,

    /// Manager: how long after closing a grant may still be issued.
    /// Contractor: grace after the announcement deadline before giving up.
    pub grant_wait_secs: u64,

    /// Manager: how long a granted contractor has to report
    pub grant_timeout_secs: u64,

    /// Contractor: how long to wait for an acknowledgement
    pub ack_timeout_secs: u64,

    /// Requester: default reply timeout
    pub request_timeout_secs: u64,

    /// How long finished session ids are remembered
    pub tombstone_ttl_secs: u64,

    /// Retry wrapper defaults
    pub retry: RetryConfig,
}

impl Default for AgencyConfig {
    fn default() -> Self {
        Self {
            shard: "default".to_string(),
            announce_timeout_secs: 10,
            grant_wait_secs: 10,
            grant_timeout_secs: 60,
            ack_timeout_secs: 10,
            request_timeout_secs: 10,
            tombstone_ttl_secs: 300,
            retry: RetryConfig::default(),
        }
    }
}

impl AgencyConfig {
    /// Bid collection window
    pub fn announce_timeout(&self) -> Duration {
        secs(self.announce_timeout_secs)
    }

    /// Grant decision window / contractor grace
    pub fn grant_wait(&self) -> Duration {
        secs(self.grant_wait_secs)
    }

    /// Report deadline after a grant
    pub fn grant_timeout(&self) -> Duration {
        secs(self.grant_timeout_secs)
    }

    /// Acknowledgement wait
    pub fn ack_timeout(&self) -> Duration {
        secs(self.ack_timeout_secs)
    }

    /// Default request timeout
    pub fn request_timeout(&self) -> Duration {
        secs(self.request_timeout_secs)
    }

    /// Tombstone lifetime
    pub fn tombstone_ttl(&self) -> Duration {
        secs(self.tombstone_ttl_secs)
    }
}

/// Retry wrapper configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_delay_ms: u64,

    /// Backoff cap
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based), doubling up to the cap
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(32);
        let ms = self.initial_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        i64::try_from(ms)
            .ok()
            .and_then(Duration::try_milliseconds)
            .unwrap_or(Duration::MAX)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Whole seconds as a `Duration`, saturating for values chrono cannot hold.
pub(crate) fn secs(s: u64) -> Duration {
    i64::try_from(s)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}
