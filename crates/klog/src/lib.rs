//! Kernel logging subsystem.
//!
//! A `log::Log` backend on COM1. Every crate in the kernel logs through the
//! `log` macros; this crate decides what a record looks like on the wire:
//!
//! ```text
//! [ INFO] cpu0 kcore::state: spawned pid 1 at 0xffffffff80012340
//! ```
#![no_std]

use core::fmt;

use log::{Level, LevelFilter, Log, Metadata, Record};

fn label(level: Level) -> &'static str {
    match level {
        Level::Trace => "TRACE",
        Level::Debug => "DEBUG",
        Level::Info => " INFO",
        Level::Warn => " WARN",
        Level::Error => "ERROR",
    }
}

fn color(level: Level) -> &'static str {
    match level {
        Level::Trace => "\x1b[90m", // Gray
        Level::Debug => "\x1b[36m", // Cyan
        Level::Info => "\x1b[32m",  // Green
        Level::Warn => "\x1b[33m",  // Yellow
        Level::Error => "\x1b[31m", // Red
    }
}

struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // The serial lock is not interrupt-safe: a timer interrupt that logs
        // while this CPU holds it would spin forever.
        kcore::arch::without_interrupts(|| {
            khal::serial::write_fmt(format_args!(
                "{}[{}]\x1b[0m {} {}: {}\n",
                color(record.level()),
                label(record.level()),
                kcore::cpu_id(),
                record.target(),
                record.args()
            ));
        });
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Initialize the serial port and install the kernel logger.
pub fn init(level: LevelFilter) {
    let loopback_ok = khal::serial::init();
    // A second init only changes the level.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
    if !loopback_ok {
        log::warn!("serial loopback test failed, output may be lost");
    }
}

/// Change the level once the boot options are known.
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

/// Panic output: bypasses the logger and the serial lock.
pub fn emergency(args: fmt::Arguments) {
    khal::serial::write_fmt_unlocked(format_args!(
        "{}[PANIC]\x1b[0m {}: {}\n",
        color(Level::Error),
        kcore::cpu_id(),
        args
    ));
}
