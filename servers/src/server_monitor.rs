use anyhow::{Context, Result};
use lib_common::configs::config_monitor::load_config;
use lib_common::core::Reactor;
use lib_common::SensorMonitor;
use std::rc::Rc;

mod monitor_logic;
use monitor_logic::logging;

fn main() -> Result<()> {
    let config = load_config()?;
    if let Some(log_path) = logging::setup(&config)? {
        log::info!("Writing log file {}", log_path.display());
    }

    let settings = config.monitor_settings()?;
    log::debug!("Effective settings: {:?}", settings);

    let reactor = Rc::new(Reactor::new().context("Failed to create the readiness multiplexer")?);
    let monitor = SensorMonitor::start_on(Rc::clone(&reactor), settings)
        .context("Failed to start the ingestion listener")?;

    #[cfg(unix)]
    let signals = monitor_logic::shutdown::ShutdownSignals::install(&reactor)
        .context("Failed to install signal handlers")?;

    monitor.run();

    #[cfg(unix)]
    {
        if let Some(signal) = signals.received() {
            log::debug!("Stopped by signal {}", signal);
        }
        signals.uninstall();
    }

    monitor.shutdown();
    log::info!("Shutdown complete.");
    Ok(())
}
