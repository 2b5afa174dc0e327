//! # Sensors
//!
//! A sensor is identified by the (resource, metric) pair chosen by its
//! producer. `SensorKey` carries that identity and is what every map and
//! lookup in the crate is keyed on. `Sensor` adds the mutable state: the last
//! measurement and when it arrived.

use std::fmt;

use chrono::{DateTime, Utc};

/// # Sensor Key
///
/// Identity of a sensor. Two keys built independently from the same strings
/// are equal and hash the same.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SensorKey {
    resource: String,
    metric: String,
}

impl SensorKey {
    /// Builds a key from a resource and a metric name.
    pub fn new(resource: impl Into<String>, metric: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            metric: metric.into(),
        }
    }

    /// The resource name (e.g. a host).
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The metric name (e.g. `cpu`).
    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// True when this key names `resource` / `metric`.
    pub fn matches(&self, resource: &str, metric: &str) -> bool {
        self.resource == resource && self.metric == metric
    }
}

impl fmt::Display for SensorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.metric)
    }
}

/// # Sensor
///
/// Snapshot of a sensor as held by the registry. Listeners receive it by
/// reference on every update.
#[derive(Debug, Clone, PartialEq)]
pub struct Sensor {
    key: SensorKey,
    last_measurement: f64,
    last_update: Option<DateTime<Utc>>,
}

impl Sensor {
    pub(crate) fn new(key: SensorKey) -> Self {
        Self {
            key,
            last_measurement: 0.0,
            last_update: None,
        }
    }

    pub(crate) fn update_measurement(&mut self, value: f64) {
        self.last_measurement = value;
        self.last_update = Some(Utc::now());
    }

    /// Identity of the sensor.
    pub fn key(&self) -> &SensorKey {
        &self.key
    }

    /// Shorthand for `key().resource()`.
    pub fn resource(&self) -> &str {
        self.key.resource()
    }

    /// Shorthand for `key().metric()`.
    pub fn metric(&self) -> &str {
        self.key.metric()
    }

    /// The most recent value. `0.0` until the first measurement lands.
    pub fn last_measurement(&self) -> f64 {
        self.last_measurement
    }

    /// When the last measurement was recorded, `None` before the first one.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }
}
