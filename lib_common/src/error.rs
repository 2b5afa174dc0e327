//! # Monitor Errors
//!
//! Error type for the data plane. Per-connection failures never surface here:
//! they are handled (logged, connection dropped) inside the component that owns
//! the connection. What remains are startup and control-path failures that the
//! caller has to decide about.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// # Monitor Error
///
/// Failures returned by the reactor, the ingestion listener, subscription
/// endpoints and the `SensorMonitor` facade.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Generic I/O failure, e.g. creating the readiness multiplexer.
    #[error("I/O error occurred: {0}")]
    Io(#[from] io::Error),

    /// A listening socket could not be bound for a reason other than the port
    /// being taken.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// The address that was attempted.
        addr: SocketAddr,
        /// The underlying socket error.
        source: io::Error,
    },

    /// The configured retry cap was reached without finding a free port.
    #[error("No free port found in {start}..={end} after {attempts} attempts")]
    PortsExhausted {
        /// First port of the candidate range.
        start: u16,
        /// Last port of the candidate range (inclusive).
        end: u16,
        /// Number of attempts made.
        attempts: usize,
    },

    /// A port range with `start > end` or starting at port 0.
    #[error("Invalid port range {start}..={end}")]
    InvalidPortRange {
        /// First port of the rejected range.
        start: u16,
        /// Last port of the rejected range.
        end: u16,
    },

    /// A subscription was requested for a sensor the registry has never seen.
    #[error("Unknown sensor {resource}:{metric}")]
    UnknownSensor {
        /// Resource name that was requested.
        resource: String,
        /// Metric name that was requested.
        metric: String,
    },

    /// The socket was bound but could not be attached to the reactor.
    #[error("Failed to register channel with the reactor: {source}")]
    Register {
        /// The underlying multiplexer error.
        source: io::Error,
    },
}

/// Convenience alias used throughout the data plane.
pub type MonitorResult<T> = Result<T, MonitorError>;
