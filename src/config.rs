//! Station poller configuration
//!
//! Loaded once at startup from a YAML file:
//!
//! ```yaml
//! name: Sjofartsverket      # optional, prefix for every sensor id
//! location: "2,114"         # required, one station id or a comma-separated list
//! numeric_values: true      # optional, strip units and publish bare numbers
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::sensor::ValueMode;

/// Prefix used when the config does not name one.
pub const DEFAULT_NAME: &str = "Sjofartsverket";

/// Config file read when `SJOFART_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "sjofartsverket.yaml";

/// Time between two polls of the same station.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Upper bound on a single ViVa request.
pub const FETCH_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("`location` must name at least one station id")]
    NoStations,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_name")]
    pub name: String,
    pub location: String,
    #[serde(default)]
    pub numeric_values: bool,
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

impl Config {
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        if config.stations().is_empty() {
            return Err(ConfigError::NoStations);
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    /// Station ids from `location`, in configured order.
    ///
    /// Each id gets its own independent pipeline.
    pub fn stations(&self) -> Vec<String> {
        self.location
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn value_mode(&self) -> ValueMode {
        if self.numeric_values {
            ValueMode::Numeric
        } else {
            ValueMode::Raw
        }
    }
}

/// Resolve the config path from `SJOFART_CONFIG`, falling back to the default.
pub fn config_path() -> PathBuf {
    std::env::var("SJOFART_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}
