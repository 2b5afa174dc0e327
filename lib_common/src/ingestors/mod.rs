//! # Data Ingestors Module
//!
//! The front door for measurements entering the system. `sensor_collector`
//! accepts producer connections on the ingestion port, decodes their line
//! protocol and records every reading in the `SensorRegistry`.

/// The ingestion listener and its per-producer connections.
pub mod sensor_collector;

// --- Public API Re-exports ---
pub use sensor_collector::{ConnectionState, ProducerConnection, SensorCollector};
