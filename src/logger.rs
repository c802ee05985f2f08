//! Process-wide logger. Ambient stack only — never part of the public API surface.

use std::fmt::{self, Display};
use std::sync::OnceLock;

/// Severity level of a log message, ordered from most to least urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
}

impl Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Fatal => write!(f, "[FATAL]"),
            Severity::Error => write!(f, "[ERROR]"),
            Severity::Warn => write!(f, "[WARN]"),
            Severity::Info => write!(f, "[INFO]"),
            Severity::Debug => write!(f, "[DEBUG]"),
        }
    }
}

pub struct Logger;

impl Logger {
    pub fn log(&self, level: Severity, msg: String) {
        match level {
            Severity::Fatal | Severity::Error => eprintln!("{level} {msg}"),
            _ => println!("{level} {msg}"),
        }
    }
}

static GLOBAL_LOGGER: OnceLock<Logger> = OnceLock::new();

pub fn get_logger() -> &'static Logger {
    GLOBAL_LOGGER.get_or_init(|| Logger)
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logger::get_logger().log($crate::logger::Severity::Debug, format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logger::get_logger().log($crate::logger::Severity::Info, format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logger::get_logger().log($crate::logger::Severity::Warn, format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logger::get_logger().log($crate::logger::Severity::Error, format!($($arg)*))
    };
}

/// Drop-in replacement for `println!` that goes through the logging system.
#[macro_export]
macro_rules! log_println {
    ($($arg:tt)*) => {
        $crate::logger::get_logger().log($crate::logger::Severity::Info, format!($($arg)*))
    };
}

/// Drop-in replacement for `eprintln!` that goes through the logging system.
#[macro_export]
macro_rules! log_eprintln {
    ($($arg:tt)*) => {
        $crate::logger::get_logger().log($crate::logger::Severity::Error, format!($($arg)*))
    };
}
