//! Configuration for the gateway server.
//!
//! Loaded from a JSON file named by `--config`/`$CONFIG`. Fields use serde
//! defaults that fall back to environment variables, then to hardcoded
//! defaults, so a missing config file is not an error.

use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::chain::Chain;

/// CLI arguments for the gateway server.
#[derive(Parser, Debug)]
#[command(name = "railgate")]
#[command(about = "Payment reconciliation gateway HTTP server")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "config_defaults::default_port")]
    port: u16,
    #[serde(default = "config_defaults::default_host")]
    host: IpAddr,
    /// Seconds a pending payment may live before the sweeper expires it.
    #[serde(default = "config_defaults::default_payment_ttl_secs")]
    payment_ttl_secs: u64,
    #[serde(default = "config_defaults::default_sweep_interval_secs")]
    sweep_interval_secs: u64,
    #[serde(default = "config_defaults::default_poll_interval_secs")]
    poll_interval_secs: u64,
    /// Per-chain confirmation-threshold overrides; chains not listed use
    /// their built-in defaults.
    #[serde(default)]
    confirmations: HashMap<Chain, u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: config_defaults::default_port(),
            host: config_defaults::default_host(),
            payment_ttl_secs: config_defaults::default_payment_ttl_secs(),
            sweep_interval_secs: config_defaults::default_sweep_interval_secs(),
            poll_interval_secs: config_defaults::default_poll_interval_secs(),
            confirmations: HashMap::new(),
        }
    }
}

pub mod config_defaults {
    use std::env;
    use std::net::IpAddr;

    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_HOST: &str = "0.0.0.0";
    pub const DEFAULT_PAYMENT_TTL_SECS: u64 = 900;
    pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
    pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;

    fn env_u64(key: &str, fallback: u64) -> u64 {
        env::var(key)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(fallback)
    }

    /// Fallback: $PORT env var -> 8080
    pub fn default_port() -> u16 {
        env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }

    /// Fallback: $HOST env var -> "0.0.0.0"
    pub fn default_host() -> IpAddr {
        env::var("HOST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(IpAddr::V4(DEFAULT_HOST.parse().unwrap()))
    }

    pub fn default_payment_ttl_secs() -> u64 {
        env_u64("PAYMENT_TTL_SECS", DEFAULT_PAYMENT_TTL_SECS)
    }

    pub fn default_sweep_interval_secs() -> u64 {
        env_u64("SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS)
    }

    pub fn default_poll_interval_secs() -> u64 {
        env_u64("POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn payment_ttl_secs(&self) -> u64 {
        self.payment_ttl_secs
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn confirmations(&self) -> &HashMap<Chain, u64> {
        &self.confirmations
    }

    /// Load configuration from CLI arguments and the JSON file.
    ///
    /// A missing config file falls back to env-var/default resolution so the
    /// server starts with zero files present.
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        Self::load_from_path(cli_args.config)
    }

    fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Config::default());
        }
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path, e))?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_confirmation_overrides() {
        let config: Config = serde_json::from_str(
            r#"{
                "port": 9000,
                "payment_ttl_secs": 600,
                "confirmations": { "ethereum": 6, "polygon": 64 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.port(), 9000);
        assert_eq!(config.payment_ttl_secs(), 600);
        assert_eq!(config.confirmations().get(&Chain::Ethereum), Some(&6));
        assert_eq!(config.confirmations().get(&Chain::Polygon), Some(&64));
        assert!(config.confirmations().get(&Chain::Solana).is_none());
    }

    #[test]
    fn test_empty_object_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.poll_interval(), Duration::from_secs(15));
    }
}
