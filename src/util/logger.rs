use log::{self, LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::env;

/// Minimal logger for the `log` facade, in the spirit of SimpleLogger
/// from the `log` crate. Embedders that install their own logger first
/// simply win; `try_init` reports the conflict and the caller ignores it.
struct HeapLogger;

impl Log for HeapLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!(
                "[{}:{}:{}] {}",
                record.level(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: HeapLogger = HeapLogger;

/// Install the logger, picking the max level from the `RUST_LOG`
/// environment variable (defaults to `Info`).
pub fn try_init() -> Result<(), SetLoggerError> {
    match env::var("RUST_LOG") {
        Ok(log_level) => match log_level.to_uppercase().as_str() {
            "OFF" => log::set_max_level(LevelFilter::Off),
            "ERROR" => log::set_max_level(LevelFilter::Error),
            "WARN" => log::set_max_level(LevelFilter::Warn),
            "INFO" => log::set_max_level(LevelFilter::Info),
            "DEBUG" => log::set_max_level(LevelFilter::Debug),
            "TRACE" => log::set_max_level(LevelFilter::Trace),
            _ => log::set_max_level(LevelFilter::Info),
        },
        Err(_) => log::set_max_level(LevelFilter::Info),
    }
    log::set_logger(&LOGGER)
}
