//! # Wire Protocols
//!
//! Two text formats, both `#`-delimited:
//!
//! - **Ingestion** (producer → server): `resource#metric#value`, one message
//!   per line. The value is a decimal float in the locale-independent
//!   notation `str::parse::<f64>` accepts.
//! - **Subscription** (server → subscriber): `#resource#metric#value#`, value
//!   printed fixed-point with `VALUE_PRECISION` decimals. No length prefix,
//!   no terminator beyond the delimiters, no acknowledgement.

use std::str;

use thiserror::Error;

use super::sensor::{Sensor, SensorKey};

/// Field separator of both protocols.
pub const FIELD_SEPARATOR: char = '#';

/// Decimals printed for the value in subscription payloads.
pub const VALUE_PRECISION: usize = 6;

const INGESTION_FIELDS: usize = 3;

/// # Decode Error
///
/// Reasons an ingestion message is rejected. Each one closes the producer
/// connection it arrived on.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// The message bytes are not valid UTF-8.
    #[error("Message is not valid UTF-8")]
    NotUtf8,

    /// Anything other than exactly three fields.
    #[error("Expected 3 '#'-separated fields, found {found}")]
    FieldCount {
        /// Number of fields in the message.
        found: usize,
    },

    /// The resource or metric field is empty.
    #[error("Field '{field}' is empty")]
    EmptyField {
        /// Name of the empty field.
        field: &'static str,
    },

    /// The value does not parse as a finite decimal number.
    #[error("Value '{value}' is not a finite decimal number")]
    InvalidValue {
        /// The rejected value field.
        value: String,
    },

    /// No line terminator within the allowed message length.
    #[error("Message of {len} bytes exceeds the {max} byte limit")]
    MessageTooLong {
        /// Bytes buffered so far.
        len: usize,
        /// Configured limit.
        max: usize,
    },
}

/// # Sensor Reading
///
/// One decoded ingestion message.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    /// Resource name as sent by the producer.
    pub resource: String,
    /// Metric name as sent by the producer.
    pub metric: String,
    /// The measurement.
    pub value: f64,
}

impl SensorReading {
    /// # Decode
    ///
    /// Parses one ingestion message (without its line terminator; a trailing
    /// `\r` is tolerated).
    pub fn decode(line: &[u8]) -> Result<Self, DecodeError> {
        let text = str::from_utf8(line).map_err(|_| DecodeError::NotUtf8)?;
        let text = text.strip_suffix('\r').unwrap_or(text);

        let fields: Vec<&str> = text.split(FIELD_SEPARATOR).collect();
        if fields.len() != INGESTION_FIELDS {
            return Err(DecodeError::FieldCount { found: fields.len() });
        }

        let (resource, metric, raw_value) = (fields[0], fields[1], fields[2]);
        if resource.is_empty() {
            return Err(DecodeError::EmptyField { field: "resource" });
        }
        if metric.is_empty() {
            return Err(DecodeError::EmptyField { field: "metric" });
        }

        let value = raw_value
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| DecodeError::InvalidValue {
                value: raw_value.to_string(),
            })?;

        Ok(Self {
            resource: resource.to_string(),
            metric: metric.to_string(),
            value,
        })
    }

    /// Identity named by this reading.
    pub fn key(&self) -> SensorKey {
        SensorKey::new(self.resource.as_str(), self.metric.as_str())
    }

    /// Encodes the reading in ingestion format, newline-terminated.
    pub fn encode(&self) -> String {
        format!("{}#{}#{}\n", self.resource, self.metric, self.value)
    }
}

/// Builds the subscription payload for the sensor's current state.
pub fn encode_update(sensor: &Sensor) -> String {
    format!(
        "#{}#{}#{:.prec$}#",
        sensor.resource(),
        sensor.metric(),
        sensor.last_measurement(),
        prec = VALUE_PRECISION
    )
}

/// # Update Splitter
///
/// Subscriber side of the subscription protocol. Payloads carry no framing,
/// so a frame ends at its fourth `#`. Pulls the next complete frame out of
/// `pending` and decodes it; `None` until one has been buffered.
pub fn next_update(pending: &mut Vec<u8>) -> Option<Result<SensorReading, DecodeError>> {
    let (end, _) = pending
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == FIELD_SEPARATOR as u8)
        .nth(INGESTION_FIELDS)?;
    let frame: Vec<u8> = pending.drain(..=end).collect();
    Some(SensorReading::decode(&frame[1..frame.len() - 1]))
}

/// # Line Splitter
///
/// Pulls the next complete line out of `pending`, leaving the remainder.
/// Returns `None` until a `\n` has been buffered.
pub fn next_line(pending: &mut Vec<u8>) -> Option<Vec<u8>> {
    let end = pending.iter().position(|&b| b == b'\n')?;
    let mut line: Vec<u8> = pending.drain(..=end).collect();
    line.pop();
    Some(line)
}

/// True for lines that carry no message (empty or whitespace only).
pub fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}
