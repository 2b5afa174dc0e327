//! # Core Engine Module
//!
//! The data plane of the sensor monitor. Everything here runs on one thread,
//! driven by the `Reactor`.
//!
//! ## Core Components:
//!
//! - **`reactor`**: The readiness event loop. Every socket is registered here
//!   with a `ChannelHandler`, and nothing else waits on I/O.
//!
//! - **`sensor`** / **`registry`**: Sensor identities, their last value, and
//!   the listener relation that fans every update out synchronously.
//!
//! - **`protocol`**: Decoding of producer messages and encoding of subscriber
//!   payloads.
//!
//! - **`port_binder`**: Random port selection with retry on conflicts.
//!
//! - **`subscription`**: Per-sensor endpoints that stream updates to any
//!   number of subscribers.
//!
//! - **`monitor`**: The `SensorMonitor` facade tying the pieces together.

/// Single-threaded readiness event loop.
pub mod reactor;
/// Sensor identity and state.
pub mod sensor;
/// Sensor catalogue and listener relation.
pub mod registry;
/// Ingestion and subscription wire formats.
pub mod protocol;
/// Bind with retry over a random port range.
pub mod port_binder;
/// Per-sensor fan-out endpoints.
pub mod subscription;
/// Collaborator-facing facade.
pub mod monitor;

// --- Public API Re-exports ---
pub use monitor::{MonitorSettings, SensorMonitor, SubscriptionInfo};
pub use port_binder::{bind_with_retry, BindPolicy, PortRange};
pub use protocol::{encode_update, next_update, DecodeError, SensorReading};
pub use reactor::{ChannelHandler, Interest, Reactor, Readiness, Token};
pub use registry::{ListenerId, SensorListener, SensorRegistry};
pub use sensor::{Sensor, SensorKey};
pub use subscription::SubscriptionEndpoint;
