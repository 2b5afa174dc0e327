use anyhow::Result;
use lib_common::configs::MonitorConfig;
use lib_common::loggers::{parse_level, setup_logging, LoggerLocalOptions};
use std::path::PathBuf;

const APP_NAME: &str = "server_monitor";
const KEEP_LOG_FILES: usize = 5;

pub fn log_options(config: &MonitorConfig) -> Result<LoggerLocalOptions> {
    let level = parse_level(config.log_level.as_deref().unwrap_or("info"))?;
    let log_to_file = config.log_to_file.unwrap_or(false);

    Ok(LoggerLocalOptions {
        app_name: APP_NAME.to_string(),
        tty_level: level,
        file_level: log_to_file.then_some(level),
        log_dir: config.log_dir.clone(),
        keep_files: KEEP_LOG_FILES,
    })
}

pub fn setup(config: &MonitorConfig) -> Result<Option<PathBuf>> {
    let options = log_options(config)?;
    Ok(setup_logging(&options)?)
}
