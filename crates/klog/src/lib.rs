//! Kernel logging subsystem.
//!
//! `klog` is the backend behind the `log` facade. Every kernel module logs
//! with `log::info!` and friends; this crate formats the record and hands
//! the text to whatever [`Sink`] was installed at boot (COM1 serial on bare
//! metal, a capture buffer in tests).
#![cfg_attr(not(test), no_std)]

use core::fmt::{self, Write};

use spin::{Mutex, Once};

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => " INFO",
            Level::Warn => " WARN",
            Level::Error => "ERROR",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Level::Trace => "\x1b[90m", // Gray
            Level::Debug => "\x1b[36m", // Cyan
            Level::Info => "\x1b[32m",  // Green
            Level::Warn => "\x1b[33m",  // Yellow
            Level::Error => "\x1b[31m", // Red
        }
    }
}

impl From<log::Level> for Level {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace => Level::Trace,
            log::Level::Debug => Level::Debug,
            log::Level::Info => Level::Info,
            log::Level::Warn => Level::Warn,
            log::Level::Error => Level::Error,
        }
    }
}

/// Destination for formatted log text.
///
/// Implementations must tolerate being called from interrupt context; the
/// logger already serialises calls, so a sink never sees two writers.
pub trait Sink: Sync {
    fn write_str(&self, s: &str);
}

struct SinkWriter<'a>(&'a dyn Sink);

impl Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

struct KernelLogger {
    sink: Once<&'static dyn Sink>,
    /// Serialises whole records so lines from different contexts never interleave.
    serial: Mutex<()>,
}

static LOGGER: KernelLogger = KernelLogger {
    sink: Once::new(),
    serial: Mutex::new(()),
};

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let Some(sink) = self.sink.get() else {
            return;
        };
        let _serial = self.serial.lock();
        let _ = format_record(&mut SinkWriter(*sink), record.level().into(), record.target(), *record.args());
    }

    fn flush(&self) {}
}

/// Install `sink` as the log destination and enable records up to `level`.
///
/// Only the first call installs a sink; later calls return the facade's
/// `SetLoggerError` and leave the existing sink in place.
pub fn init(sink: &'static dyn Sink, level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
    LOGGER.sink.call_once(|| sink);
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

/// Write one record as `<colour>[LEVEL]<reset> target: message\n`.
pub fn format_record(out: &mut dyn Write, level: Level, target: &str, args: fmt::Arguments) -> fmt::Result {
    out.write_str(level.color())?;
    out.write_str("[")?;
    out.write_str(level.as_str())?;
    out.write_str("]\x1b[0m ")?;
    if !target.is_empty() {
        out.write_str(target)?;
        out.write_str(": ")?;
    }
    out.write_fmt(args)?;
    out.write_str("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_has_colour_level_and_target() {
        let mut line = String::new();
        format_record(&mut line, Level::Warn, "nanocore::sync", format_args!("held by {}", 7)).unwrap();
        assert_eq!(line, "\x1b[33m[ WARN]\x1b[0m nanocore::sync: held by 7\n");
    }

    #[test]
    fn empty_target_is_omitted() {
        let mut line = String::new();
        format_record(&mut line, Level::Info, "", format_args!("boot")).unwrap();
        assert_eq!(line, "\x1b[32m[ INFO]\x1b[0m boot\n");
    }

    #[test]
    fn facade_levels_map_one_to_one() {
        assert_eq!(Level::from(log::Level::Error), Level::Error);
        assert_eq!(Level::from(log::Level::Trace), Level::Trace);
        assert!(Level::from(log::Level::Debug) < Level::from(log::Level::Info));
    }
}
