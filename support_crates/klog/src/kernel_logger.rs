//! A logging implementation which forwards log records to the firmware console
use core::fmt::Write;

use crate::print::KernelWriter;
use log::{Level, Log, Metadata, Record, SetLoggerError};

// Only the global log:: filter is updated on level changes because that avoids
// interior mutability inside the KernelLogger struct itself.

pub struct KernelLogger {
    pub initial_log_level: Level,
}

impl KernelLogger {
    pub const fn new(max_log_level: Level) -> KernelLogger {
        KernelLogger {
            initial_log_level: max_log_level,
        }
    }

    pub fn install(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self).map(|_| log::set_max_level(self.initial_log_level.to_level_filter()))
    }

    pub fn update_log_level(&'static self, level: Level) {
        log::set_max_level(level.to_level_filter());
    }
}

impl Log for KernelLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            KernelWriter {}
                .write_fmt(format_args!(
                    "[{:<5}] {}: {}\n",
                    record.level(),
                    record.target(),
                    record.args(),
                ))
                .expect("Could not write log message to the console")
        }
    }

    fn flush(&self) {}
}
