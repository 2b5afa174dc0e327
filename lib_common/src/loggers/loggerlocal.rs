//! # Local Logger
//!
//! Installs a `fern` dispatcher behind the `log` facade with two outputs:
//!
//! - the TTY, with the message coloured by level and a grey timestamp;
//! - optionally, a timestamped file `<app_name>-<YYYYmmdd_HHMMSS>.log` in
//!   `log_dir`. Older files of the same application are rotated away on
//!   startup, keeping the newest `keep_files`.
//!
//! Level names follow the seven-level scheme used across the workspace
//! (`silly`, `trace`, `debug`, `info`, `warn`, `error`, `fatal`, or `0`..`6`),
//! folded onto the five `log` levels.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use colored::*;
use fern::Dispatch;
use glob::glob;
use log::{Level, LevelFilter};
use thiserror::Error;

/// # Logger Error
#[derive(Debug, Error)]
pub enum LoggerError {
    /// Creating the log directory or opening the log file failed.
    #[error("Log file I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The rotation pattern could not be built from the log directory.
    #[error("Invalid log rotation pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    /// A global logger is already installed.
    #[error("Logger already initialised: {0}")]
    SetLogger(#[from] log::SetLoggerError),

    /// The level name is not one of the known levels.
    #[error("Unknown log level '{0}'")]
    UnknownLevel(String),
}

/// # Logger Local Options
///
/// Where and how much to log.
#[derive(Debug, Clone)]
pub struct LoggerLocalOptions {
    /// Prefix of every line and of the log file name.
    pub app_name: String,
    /// Maximum level printed on the console.
    pub tty_level: LevelFilter,
    /// Maximum level written to the log file; `None` disables the file.
    pub file_level: Option<LevelFilter>,
    /// Directory of the log file. Defaults to `./logs`.
    pub log_dir: Option<PathBuf>,
    /// How many log files of this application survive rotation, the new one
    /// included.
    pub keep_files: usize,
}

impl Default for LoggerLocalOptions {
    fn default() -> Self {
        Self {
            app_name: "app".to_string(),
            tty_level: LevelFilter::Info,
            file_level: None,
            log_dir: None,
            keep_files: 1,
        }
    }
}

impl LoggerLocalOptions {
    fn resolved_log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("logs"))
    }
}

/// Maps a level name (or its number, `0` = silly .. `6` = fatal) to a
/// `LevelFilter`. `silly` folds onto `trace`, `fatal` onto `error`.
pub fn parse_level(name: &str) -> Result<LevelFilter, LoggerError> {
    let level = match name.trim().to_lowercase().as_str() {
        "silly" | "0" | "trace" | "1" => LevelFilter::Trace,
        "debug" | "2" => LevelFilter::Debug,
        "info" | "3" => LevelFilter::Info,
        "warn" | "warning" | "4" => LevelFilter::Warn,
        "error" | "5" | "fatal" | "6" => LevelFilter::Error,
        "off" | "none" => LevelFilter::Off,
        _ => return Err(LoggerError::UnknownLevel(name.to_string())),
    };
    Ok(level)
}

/// # Rotate Logs
///
/// Deletes the log files of `app_name` in `log_dir`, newest first by the
/// timestamp in their name, beyond the first `keep`. Returns how many were
/// removed. Files that cannot be deleted are reported and skipped.
pub fn rotate_logs(app_name: &str, log_dir: &Path, keep: usize) -> Result<usize, LoggerError> {
    let pattern = format!("{}/{}-*.log", log_dir.display(), app_name);
    let mut log_files: Vec<PathBuf> = glob(&pattern)?.filter_map(Result::ok).collect();

    log_files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    let mut removed = 0;
    for old_file in log_files.iter().skip(keep) {
        match fs::remove_file(old_file) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Error deleting old log file {}: {}", old_file.display(), e),
        }
    }
    Ok(removed)
}

fn colorize(level: Level, message: &str) -> ColoredString {
    match level {
        Level::Error => message.bright_red(),
        Level::Warn => message.bright_yellow(),
        Level::Info => message.bright_green(),
        Level::Debug => message.bright_white(),
        Level::Trace => message.bright_cyan(),
    }
}

/// # Build Dispatch
///
/// Builds the dispatcher without installing it. When file logging is on, the
/// directory is created, old files are rotated and the new file is opened.
/// Returns the path of that file.
pub fn build_dispatch(options: &LoggerLocalOptions) -> Result<(Dispatch, Option<PathBuf>), LoggerError> {
    let tty_app = options.app_name.clone();
    let tty = Dispatch::new()
        .level(options.tty_level)
        .format(move |out, message, record| {
            let ts = Local::now()
                .format("%Y-%m-%d %H:%M:%S%.3f")
                .to_string()
                .truecolor(128, 128, 128);
            let app = format!("[{}]", tty_app).truecolor(128, 128, 128);
            out.finish(format_args!(
                "{}{}[{}] {}",
                ts,
                app,
                record.target(),
                colorize(record.level(), &message.to_string())
            ))
        })
        .chain(io::stdout());

    let mut max_level = options.tty_level;
    let mut dispatch = Dispatch::new().chain(tty);
    let mut log_path = None;

    if let Some(file_level) = options.file_level {
        let log_dir = options.resolved_log_dir();
        fs::create_dir_all(&log_dir)?;
        // Make room for the file about to be created.
        rotate_logs(&options.app_name, &log_dir, options.keep_files.saturating_sub(1))?;

        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let path = log_dir.join(format!("{}-{}.log", options.app_name, timestamp));

        let file_app = options.app_name.clone();
        let file = Dispatch::new()
            .level(file_level)
            .format(move |out, message, record| {
                out.finish(format_args!(
                    "{} [{}] {} {}: {}",
                    Local::now().to_rfc3339(),
                    file_app,
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .chain(fern::log_file(&path)?);

        dispatch = dispatch.chain(file);
        max_level = max_level.max(file_level);
        log_path = Some(path);
    }

    Ok((dispatch.level(max_level), log_path))
}

/// # Setup Logging
///
/// Builds the dispatcher and installs it as the global logger. Can only
/// succeed once per process.
pub fn setup_logging(options: &LoggerLocalOptions) -> Result<Option<PathBuf>, LoggerError> {
    let (dispatch, log_path) = build_dispatch(options)?;
    dispatch.apply()?;
    if let Some(path) = &log_path {
        log::debug!("Logging to {}", path.display());
    }
    Ok(log_path)
}
