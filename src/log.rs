//! A minimal [`log::Log`] implementation that writes to stderr.
//!
//! The rest of the crate only ever calls the `log` crate's macros
//! (`trace!`/`debug!`/`warn!`/`error!`); which `Log` implementation receives
//! them is the embedder's choice. [`StderrLogger`] is provided as a
//! reasonable default for applications that don't bring their own.

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::Write;

pub struct StderrLogger {
    level: LevelFilter,
}

impl StderrLogger {
    pub fn new(level: LevelFilter) -> Self {
        StderrLogger { level }
    }

    /// Installs this logger as the global `log` logger. Must be called at
    /// most once per process.
    pub fn init(level: LevelFilter) {
        log::set_max_level(level);
        log::set_boxed_logger(Box::new(StderrLogger::new(level)))
            .expect("corort: a logger was already installed");
    }
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("<unnamed>");
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let mut stderr = std::io::stderr();
        let _ = writeln!(
            stderr,
            "{:>9.3} [{thread_name}] {level} {}: {}",
            crate::clock::monotonic(),
            record.target(),
            record.args(),
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}
