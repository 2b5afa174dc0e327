//! # Loggers
//!
//! Console and file logging for the server binaries. Library code only ever
//! uses the `log` macros; this module decides where the records go.

/// Coloured TTY output plus a rotated log file, built on `fern`.
pub mod loggerlocal;

pub use loggerlocal::{parse_level, setup_logging, LoggerError, LoggerLocalOptions};
