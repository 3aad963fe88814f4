//! Kernel logging facility
//!
//! Routes the `log` crate to COM1. Log levels are configured based on build
//! configuration (debug/release).

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger::new();

/// Serial-backed logger
pub struct Logger;

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub const fn new() -> Logger {
        Logger
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats messages as "[LEVEL] message", one serial write per record
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::serial_println!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Maximum level for the current build: Debug in debug builds, Info in
/// release builds.
pub const fn max_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Installs [`LOGGER`]. Fails if a logger is already set.
pub fn init() -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER).map(|()| log::set_max_level(max_level()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn build_level() {
        if cfg!(debug_assertions) {
            assert_eq!(max_level(), LevelFilter::Debug);
        } else {
            assert_eq!(max_level(), LevelFilter::Info);
        }
        assert!(max_level() < Level::Trace);
    }
}
