//! # Configuration Modules
//!
//! Layered configuration for the sensor monitor: built-in defaults, a JSON
//! file, then environment variables and command-line flags.

/// Sensor monitor configuration (`server_monitor.conf`).
pub mod config_monitor;

pub use config_monitor::{ConfigError, MonitorConfig};
