//! Stderr logger for the CLI.
//!
//! The library crates log through the `log` facade (GC cycle summaries,
//! per-function compile notes). The driver binds that facade to stderr,
//! level-gated by the `QUILL_LOG` environment variable. Unset or
//! unrecognized values leave logging off.

use log::{LevelFilter, Log, Metadata, Record};

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Installs the stderr logger according to `QUILL_LOG`.
pub fn init() {
    let level = match std::env::var("QUILL_LOG").map(|v| v.to_ascii_lowercase()) {
        Ok(value) => match value.as_str() {
            "error" => LevelFilter::Error,
            "warn" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "debug" => LevelFilter::Debug,
            "trace" => LevelFilter::Trace,
            _ => LevelFilter::Off,
        },
        Err(_) => LevelFilter::Off,
    };
    if level == LevelFilter::Off {
        return;
    }
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
