//! # lib_common
//!
//! Shared library of the sensor monitor workspace. The `core` module is the
//! data plane: a single-threaded `mio` reactor, the sensor registry fed by the
//! ingestion listener, and the per-sensor subscription endpoints that fan the
//! measurements out to subscribers. `configs` and `loggers` carry the ambient
//! concerns used by the server binaries.
//!
//! Modules are gated by Cargo features (`core`, `configs`, `loggers`, `full`).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Reactor, sensor registry, ingestion and subscription fan-out.
#[cfg(feature = "core")]
pub mod core;
/// Error types shared by the data plane.
#[cfg(feature = "core")]
pub mod error;
/// Receives producer connections and feeds the sensor registry.
#[cfg(feature = "core")]
pub mod ingestors;

/// Layered configuration for the server binaries.
#[cfg(feature = "configs")]
pub mod configs;
/// Console and file logging built on `fern`.
#[cfg(feature = "loggers")]
pub mod loggers;

// Re-export the entry points most callers need.
#[cfg(feature = "core")]
pub use crate::core::{MonitorSettings, SensorMonitor, SubscriptionInfo};
#[cfg(feature = "core")]
pub use crate::error::MonitorError;
