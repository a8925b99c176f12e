//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::storage::{Backend, ConnectionOptions};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// SQLite database file, relative to `data_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,
}

fn default_backend() -> Backend {
    Backend::Sqlite
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("meterstore").to_string_lossy().to_string())
        .unwrap_or_else(|| "./meterstore_data".to_string())
}

fn default_database_file() -> String {
    "meterstore.db".to_string()
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.database_file)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: default_data_dir(),
            database_file: default_database_file(),
        }
    }
}

/// Data retention and statistics defaults
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Maximum sample age in seconds; zero or negative keeps samples forever
    #[serde(default = "default_time_to_live")]
    pub time_to_live_secs: i64,

    /// Statistics period used when a query does not name one
    #[serde(default)]
    pub default_period_secs: u64,
}

fn default_time_to_live() -> i64 {
    -1
}

impl RetentionConfig {
    /// Age to purge at, if expiry is enabled
    pub fn max_age(&self) -> Option<u64> {
        u64::try_from(self.time_to_live_secs).ok().filter(|ttl| *ttl > 0)
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            time_to_live_secs: default_time_to_live(),
            default_period_secs: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("meterstore").join("config.toml")),
            Some(PathBuf::from("/etc/meterstore/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Options every backend is opened with
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions::default().default_period(self.retention.default_period_secs)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a variable lookup; unparsable values are ignored
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Storage overrides
        if let Some(backend) = var("METERSTORE_BACKEND") {
            match backend.parse() {
                Ok(b) => self.storage.backend = b,
                Err(e) => tracing::warn!("Ignoring METERSTORE_BACKEND: {}", e),
            }
        }
        if let Some(data_dir) = var("METERSTORE_DATA_DIR") {
            self.storage.data_dir = data_dir;
        }

        // Retention overrides
        if let Some(ttl) = var("METERSTORE_TTL") {
            if let Ok(t) = ttl.parse() {
                self.retention.time_to_live_secs = t;
            }
        }
        if let Some(period) = var("METERSTORE_DEFAULT_PERIOD") {
            if let Ok(p) = period.parse() {
                self.retention.default_period_secs = p;
            }
        }

        // Logging overrides
        if let Some(level) = var("METERSTORE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("METERSTORE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Meterstore Configuration
#
# Environment variables override these settings:
# - METERSTORE_BACKEND
# - METERSTORE_DATA_DIR
# - METERSTORE_TTL
# - METERSTORE_DEFAULT_PERIOD
# - METERSTORE_LOG_LEVEL
# - METERSTORE_LOG_FORMAT

[storage]
# Backend: sqlite, memory (not persistent) or log (records nothing)
backend = "sqlite"

# Directory for the database file
data_dir = "~/.local/share/meterstore"

# SQLite database file name inside data_dir
database_file = "meterstore.db"

[retention]
# Samples older than this many seconds are removed by `meterstore expire`.
# Zero or negative keeps them forever.
time_to_live_secs = -1

# Statistics period in seconds when a query does not give one.
# Zero returns a single bucket over the whole range.
default_period_secs = 0

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"

# Optional log file path
# file = "/var/log/meterstore/meterstore.log"
"#
    .to_string()
}
