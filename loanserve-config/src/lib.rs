#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Environment-driven configuration (spec 6, "Environment variables
//! recognized"). No derive-based config crate: variables are read and
//! validated by hand, matching the teacher's preference for explicit
//! request/config normalization over a derive macro that would hide the
//! fail-fast behavior required here.

use std::env::VarError;
use std::time::Duration;

use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(String),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: String,
    pub mgmt_url: Option<String>,
    pub vhost: String,
}

#[derive(Debug, Clone, Copy)]
pub struct LockoutConfig {
    pub threshold: u32,
    pub window: Duration,
    pub auto_unlock: Duration,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Duration::from_secs(15 * 60),
            auto_unlock: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    pub database_url: String,
    pub encryption_key: Option<String>,
    pub pii_salt: Option<String>,
    pub lockout: LockoutConfig,
}

fn required(name: &str) -> ConfigResult<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        Ok(_) => Err(ConfigError::Invalid {
            var: name.to_string(),
            reason: "must not be empty".into(),
        }),
        Err(VarError::NotPresent) => Err(ConfigError::Missing(name.to_string())),
        Err(VarError::NotUnicode(_)) => Err(ConfigError::Invalid {
            var: name.to_string(),
            reason: "must be valid UTF-8".into(),
        }),
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn optional_u32(name: &str, default: u32) -> ConfigResult<u32> {
    match optional(name) {
        None => Ok(default),
        Some(raw) => raw.parse::<u32>().map_err(|_| ConfigError::Invalid {
            var: name.to_string(),
            reason: format!("must be a non-negative integer, got {raw:?}"),
        }),
    }
}

impl Config {
    /// Loads a local `.env` (if present, ignored if missing) then reads the
    /// process environment. Required variables missing or malformed cause an
    /// immediate error rather than a partially-usable config.
    pub fn load() -> ConfigResult<Self> {
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    /// Reads configuration from whatever is already in the process
    /// environment, without touching `.env`. Used by tests that set
    /// variables directly.
    pub fn from_env() -> ConfigResult<Self> {
        let broker_url = required("BROKER_URL")?;
        let mgmt_url = optional("BROKER_MGMT_URL");
        let vhost = optional("BROKER_VHOST").unwrap_or_else(|| "/".to_string());
        let database_url = required("DATABASE_URL")?;
        let encryption_key = optional("ENCRYPTION_KEY");
        let pii_salt = optional("PII_SALT");

        let threshold = optional_u32("LOCKOUT_THRESHOLD", LockoutConfig::default().threshold)?;
        let window_minutes = optional_u32(
            "LOCKOUT_WINDOW_MINUTES",
            (LockoutConfig::default().window.as_secs() / 60) as u32,
        )?;
        let auto_unlock_minutes = optional_u32(
            "LOCKOUT_AUTO_UNLOCK_MINUTES",
            (LockoutConfig::default().auto_unlock.as_secs() / 60) as u32,
        )?;

        Ok(Config {
            broker: BrokerConfig {
                url: broker_url,
                mgmt_url,
                vhost,
            },
            database_url,
            encryption_key,
            pii_salt,
            lockout: LockoutConfig {
                threshold,
                window: Duration::from_secs(u64::from(window_minutes) * 60),
                auto_unlock: Duration::from_secs(u64::from(auto_unlock_minutes) * 60),
            },
        })
    }
}
