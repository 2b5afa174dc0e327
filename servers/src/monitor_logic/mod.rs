pub mod logging;
#[cfg(unix)]
pub mod shutdown;
