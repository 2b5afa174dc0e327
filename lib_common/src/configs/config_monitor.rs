//! # Monitor Configuration
//!
//! Every setting is optional at every layer. Layers are merged in this order,
//! later ones winning:
//!
//! 1. built-in defaults (`MonitorConfig::defaults`);
//! 2. the JSON file named by `--config-path` / `MONITOR_CONFIG_PATH`
//!    (default `server_monitor.conf`, skipped when absent);
//! 3. environment variables (a `.env` file is honoured) and CLI flags.
//!
//! The file uses camelCase keys:
//!
//! ```json
//! { "ingestionPort": 12087, "portRangeStart": 20000, "portRangeEnd": 30000,
//!   "bindAttempts": 0, "autoSubscribe": true, "logLevel": "debug" }
//! ```

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::monitor::MonitorSettings;
use crate::core::port_binder::PortRange;
use crate::error::MonitorError;

/// File read when no config path is given.
pub const DEFAULT_CONFIG_FILE: &str = "server_monitor.conf";

/// # Config Error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Read {
        /// The file that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file is not valid JSON for `MonitorConfig`.
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        /// The file that was parsed.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// A value is out of its allowed domain.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Config key.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// The settings were rejected by the monitor (e.g. an empty port range).
    #[error(transparent)]
    Settings(#[from] MonitorError),
}

/// # Monitor Config
///
/// CLI, environment and file representation of the monitor settings.
#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[command(about = "Sensor monitor: ingests sensor readings and streams them to subscribers", version)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    /// Path to the JSON configuration file.
    #[arg(long, env = "MONITOR_CONFIG_PATH")]
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// Interface to bind the ingestion listener and subscription endpoints to.
    #[arg(long, env = "MONITOR_BIND_ADDRESS")]
    pub bind_address: Option<IpAddr>,

    /// Port producers connect to.
    #[arg(long, env = "MONITOR_INGESTION_PORT")]
    pub ingestion_port: Option<u16>,

    /// Lowest port a subscription endpoint may use.
    #[arg(long, env = "MONITOR_PORT_RANGE_START")]
    pub port_range_start: Option<u16>,

    /// Highest port a subscription endpoint may use.
    #[arg(long, env = "MONITOR_PORT_RANGE_END")]
    pub port_range_end: Option<u16>,

    /// Bind attempts per subscription endpoint (0 = retry forever).
    #[arg(long, env = "MONITOR_BIND_ATTEMPTS")]
    pub bind_attempts: Option<usize>,

    /// Open a subscription endpoint for every new producer automatically.
    #[arg(long, env = "MONITOR_AUTO_SUBSCRIBE")]
    pub auto_subscribe: Option<bool>,

    /// Bytes read from a producer per read call.
    #[arg(long, env = "MONITOR_READ_BUFFER_SIZE")]
    pub read_buffer_size: Option<usize>,

    /// Longest accepted producer message, in bytes.
    #[arg(long, env = "MONITOR_MAX_MESSAGE_LEN")]
    pub max_message_len: Option<usize>,

    /// Directory for log files.
    #[arg(long, env = "MONITOR_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Logging level (silly, trace, debug, info, warn, error, fatal).
    #[arg(long, env = "MONITOR_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Also write logs to a file in the log directory.
    #[arg(long, env = "MONITOR_LOG_TO_FILE")]
    pub log_to_file: Option<bool>,
}

impl MonitorConfig {
    /// # Defaults
    ///
    /// The bottom layer: every field set.
    pub fn defaults() -> Self {
        let settings = MonitorSettings::default();
        Self {
            config_path: None,
            bind_address: Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            ingestion_port: Some(settings.ingestion_port),
            port_range_start: Some(settings.port_range.start()),
            port_range_end: Some(settings.port_range.end()),
            bind_attempts: Some(0),
            auto_subscribe: Some(settings.auto_subscribe),
            read_buffer_size: Some(settings.read_buffer_size),
            max_message_len: Some(settings.max_message_len),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            log_to_file: Some(false),
        }
    }

    /// Merges two layers; fields set in `other` win.
    pub fn merge(self, other: MonitorConfig) -> MonitorConfig {
        MonitorConfig {
            config_path: other.config_path.or(self.config_path),
            bind_address: other.bind_address.or(self.bind_address),
            ingestion_port: other.ingestion_port.or(self.ingestion_port),
            port_range_start: other.port_range_start.or(self.port_range_start),
            port_range_end: other.port_range_end.or(self.port_range_end),
            bind_attempts: other.bind_attempts.or(self.bind_attempts),
            auto_subscribe: other.auto_subscribe.or(self.auto_subscribe),
            read_buffer_size: other.read_buffer_size.or(self.read_buffer_size),
            max_message_len: other.max_message_len.or(self.max_message_len),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            log_to_file: other.log_to_file.or(self.log_to_file),
        }
    }

    /// Reads one JSON layer. `Ok(None)` when the file does not exist.
    pub fn from_file(path: &Path) -> Result<Option<MonitorConfig>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(config))
    }

    /// # Layer
    ///
    /// Stacks defaults, the config file and `overrides` (usually the parsed
    /// command line).
    pub fn layer(overrides: MonitorConfig) -> Result<MonitorConfig, ConfigError> {
        let config_path = overrides
            .config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut current = Self::defaults();
        match Self::from_file(&config_path)? {
            Some(file_config) => {
                log::info!("Loaded config file {}", config_path.display());
                current = current.merge(file_config);
            }
            None => log::info!(
                "Config file not found at {}. Using defaults and environment/CLI variables.",
                config_path.display()
            ),
        }

        let mut merged = current.merge(overrides);
        merged.config_path = Some(config_path);
        Ok(merged)
    }

    /// # Monitor Settings
    ///
    /// Validates the merged configuration and converts it for
    /// `SensorMonitor::start`. Unset fields fall back to the defaults.
    pub fn monitor_settings(&self) -> Result<MonitorSettings, ConfigError> {
        let defaults = MonitorSettings::default();

        let port_range = PortRange::new(
            self.port_range_start.unwrap_or(defaults.port_range.start()),
            self.port_range_end.unwrap_or(defaults.port_range.end()),
        )?;

        let read_buffer_size = self.read_buffer_size.unwrap_or(defaults.read_buffer_size);
        if read_buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "readBufferSize",
                reason: "must be at least 1".to_string(),
            });
        }
        let max_message_len = self.max_message_len.unwrap_or(defaults.max_message_len);
        if max_message_len == 0 {
            return Err(ConfigError::InvalidValue {
                field: "maxMessageLen",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(MonitorSettings {
            bind_address: self.bind_address.unwrap_or(defaults.bind_address),
            ingestion_port: self.ingestion_port.unwrap_or(defaults.ingestion_port),
            port_range,
            max_bind_attempts: self.bind_attempts.filter(|n| *n > 0),
            auto_subscribe: self.auto_subscribe.unwrap_or(defaults.auto_subscribe),
            read_buffer_size,
            max_message_len,
        })
    }
}

/// # Load Config
///
/// Loads `.env`, parses the command line and stacks all layers.
pub fn load_config() -> Result<MonitorConfig, ConfigError> {
    dotenvy::dotenv().ok();
    MonitorConfig::layer(MonitorConfig::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_produce_default_settings() {
        let settings = MonitorConfig::defaults().monitor_settings().unwrap();
        assert_eq!(settings, MonitorSettings::default());
    }

    #[test]
    fn test_cli_flags_parse() {
        let cli = MonitorConfig::try_parse_from([
            "server_monitor",
            "--ingestion-port",
            "9000",
            "--auto-subscribe",
            "true",
            "--bind-address",
            "127.0.0.1",
        ])
        .unwrap();

        assert_eq!(cli.ingestion_port, Some(9000));
        assert_eq!(cli.auto_subscribe, Some(true));
        assert_eq!(cli.bind_address, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn test_later_layers_win() {
        let file = MonitorConfig {
            ingestion_port: Some(7000),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        let cli = MonitorConfig {
            ingestion_port: Some(8000),
            ..Default::default()
        };

        let merged = MonitorConfig::defaults().merge(file).merge(cli);
        assert_eq!(merged.ingestion_port, Some(8000));
        assert_eq!(merged.log_level.as_deref(), Some("debug"));
        assert_eq!(merged.port_range_end, Some(65000));
    }

    #[test]
    fn test_file_layer_uses_camel_case_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server_monitor.conf");
        fs::write(
            &path,
            r#"{ "portRangeStart": 20000, "portRangeEnd": 20100, "bindAttempts": 5, "autoSubscribe": true }"#,
        )
        .unwrap();

        let overrides = MonitorConfig {
            config_path: Some(path.clone()),
            ..Default::default()
        };
        let config = MonitorConfig::layer(overrides).unwrap();
        let settings = config.monitor_settings().unwrap();

        assert_eq!(settings.port_range, PortRange::new(20000, 20100).unwrap());
        assert_eq!(settings.max_bind_attempts, Some(5));
        assert!(settings.auto_subscribe);
        assert_eq!(config.config_path, Some(path));
    }

    #[test]
    fn test_missing_file_is_skipped_and_broken_file_fails() {
        let dir = tempdir().unwrap();
        assert!(MonitorConfig::from_file(&dir.path().join("absent.conf"))
            .unwrap()
            .is_none());

        let broken = dir.path().join("broken.conf");
        fs::write(&broken, "{ not json").unwrap();
        assert!(matches!(
            MonitorConfig::from_file(&broken),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let inverted = MonitorConfig {
            port_range_start: Some(5000),
            port_range_end: Some(4000),
            ..MonitorConfig::defaults()
        };
        assert!(matches!(
            inverted.monitor_settings(),
            Err(ConfigError::Settings(MonitorError::InvalidPortRange { .. }))
        ));

        let zero_buffer = MonitorConfig {
            read_buffer_size: Some(0),
            ..MonitorConfig::defaults()
        };
        assert!(matches!(
            zero_buffer.monitor_settings(),
            Err(ConfigError::InvalidValue { field: "readBufferSize", .. })
        ));
    }
}
