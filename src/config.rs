//! Configuration loading and management.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level dispatcher configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Bus identity.
    pub bus: BusConfig,
    /// Client discovery configuration.
    #[serde(default)]
    pub clients: ClientsConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// In-process Prometheus registry configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Well-known bus name and object path prefix the dispatcher claims.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Well-known name requested at startup (e.g. "org.example.ChannelDispatcher").
    pub well_known_name: String,
    /// Object path prefix clients' bus names are rooted under.
    pub client_prefix: String,
}

/// Client descriptor discovery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientsConfig {
    /// User-specific data directory searched first (e.g. `$XDG_DATA_HOME`).
    #[serde(default = "default_user_data_dir")]
    pub user_data_dir: PathBuf,
    /// System-wide data directories searched after the user one.
    #[serde(default = "default_system_data_dirs")]
    pub system_data_dirs: Vec<PathBuf>,
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            user_data_dir: default_user_data_dir(),
            system_data_dirs: default_system_data_dirs(),
        }
    }
}

fn default_user_data_dir() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("~/.local/share"))
}

fn default_system_data_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/usr/share"), PathBuf::from("/usr/local/share")]
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `tracing-subscriber` env-filter directive, e.g. "info" or "channel_dispatcher=debug".
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Emit structured JSON instead of the compact human-readable format.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// Prometheus metrics registry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether the in-process Prometheus registry is populated at all.
    /// Surfacing it externally (HTTP, textfile collector, etc.) is left
    /// to the embedding process.
    #[serde(default)]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        validate(&config)?;
        Ok(config)
    }
}

/// Reject configurations that would leave the dispatcher unable to
/// claim a meaningful identity on the bus.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.bus.well_known_name.trim().is_empty() {
        return Err(ConfigError::Invalid("bus.well_known_name must not be empty".to_string()));
    }
    if config.bus.client_prefix.trim().is_empty() {
        return Err(ConfigError::Invalid("bus.client_prefix must not be empty".to_string()));
    }
    if !config.bus.well_known_name.starts_with(&config.bus.client_prefix) {
        return Err(ConfigError::Invalid(
            "bus.well_known_name must itself live under bus.client_prefix".to_string(),
        ));
    }
    Ok(())
}
