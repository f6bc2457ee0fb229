//! Logging utils. See ["log" crate documentation](https://docs.rs/log/)
//! for details.
//!
//! The runtime logs through the `log` facade everywhere; this module only
//! adds a minimal backend for binaries and tests that have no logger of
//! their own.
//!
//! Example:
//! ```no_run
//! strand::log::init().unwrap();
//! log::info!("Hello world");
//! ```

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::util;

/// [Log](https://docs.rs/log/latest/log/trait.Log.html) trait
/// implementation writing one line per record to stderr: level, target,
/// OS thread id, fiber id, message.
pub struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    #[inline(always)]
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        eprintln!(
            "[{:<5}] [{}] t={} f={} {}",
            record.level(),
            record.target(),
            util::thread_id(),
            util::fiber_id(),
            record.args(),
        );
    }

    #[inline(always)]
    fn flush(&self) {}
}

/// Installs [`StderrLogger`] as the global logger.
///
/// The maximum level is taken from the `STRAND_LOG` environment variable
/// (a [`LevelFilter`] name, e.g. `debug`), defaulting to `info`.
pub fn init() -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level_from_env());
    Ok(())
}

fn level_from_env() -> LevelFilter {
    match std::env::var("STRAND_LOG") {
        Ok(v) => v.parse().unwrap_or(LevelFilter::Info),
        Err(_) => LevelFilter::Info,
    }
}
