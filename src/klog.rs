//! Structured Kernel Logging
//!
//! # Log Format
//! ```text
//! <LVL> <subsys> <event> key=val ...
//! ```
//!
//! # Example
//! ```ignore
//! kinfo!("pmm", "init_ok"; pages = free, base = start as u64);
//! kerror!("ktfs", "mount_failed"; err = result.to_errno());
//! ```
//!
//! Records below the runtime level are dropped before any formatting work
//! happens. Output goes straight to the boot console.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

/// Log levels from most to least severe.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Level {
    /// Operation failed, degraded behavior likely
    Error = 0,
    /// Unexpected but recoverable
    Warn = 1,
    /// Major lifecycle events (boot, init, mount)
    Info = 2,
    /// Diagnostic state transitions
    Debug = 3,
    /// Very verbose, per-operation
    Trace = 4,
}

impl Level {
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    pub const fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(Level::Error),
            1 => Some(Level::Warn),
            2 => Some(Level::Info),
            3 => Some(Level::Debug),
            4 => Some(Level::Trace),
            _ => None,
        }
    }
}

/// Runtime log level gate. Everything above this is dropped.
static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

/// Check whether a level is currently enabled.
#[inline]
pub fn is_enabled(level: Level) -> bool {
    (level as u8) <= LOG_LEVEL.load(Ordering::Relaxed)
}

/// Set the runtime log level.
pub fn set_level(level: Level) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Current runtime log level.
pub fn level() -> Level {
    Level::from_u8(LOG_LEVEL.load(Ordering::Relaxed)).unwrap_or(Level::Info)
}

/// Emit one record. Called by the `klog!` macro after the level gate.
pub fn write_record(level: Level, subsys: &str, event: &str, kvs: fmt::Arguments) {
    crate::uart::console_write(format_args!(
        "{} {} {} {}\n",
        level.as_str(),
        subsys,
        event,
        kvs
    ));
}

#[macro_export]
macro_rules! klog {
    ($level:ident, $subsys:expr, $event:expr; $($key:ident = $val:expr),* $(,)?) => {{
        if $crate::klog::is_enabled($crate::klog::Level::$level) {
            $crate::klog::write_record(
                $crate::klog::Level::$level,
                $subsys,
                $event,
                core::format_args!(
                    core::concat!($(core::stringify!($key), "={} ",)*),
                    $($val),*
                ),
            );
        }
    }};
    ($level:ident, $subsys:expr, $event:expr) => {{
        if $crate::klog::is_enabled($crate::klog::Level::$level) {
            $crate::klog::write_record(
                $crate::klog::Level::$level,
                $subsys,
                $event,
                core::format_args!(""),
            );
        }
    }};
}

/// Convenience macro for INFO level
#[macro_export]
macro_rules! kinfo {
    ($($tt:tt)*) => { $crate::klog!(Info, $($tt)*) };
}

/// Convenience macro for ERROR level
#[macro_export]
macro_rules! kerror {
    ($($tt:tt)*) => { $crate::klog!(Error, $($tt)*) };
}

/// Convenience macro for WARN level
#[macro_export]
macro_rules! kwarn {
    ($($tt:tt)*) => { $crate::klog!(Warn, $($tt)*) };
}

/// Convenience macro for DEBUG level
#[macro_export]
macro_rules! kdebug {
    ($($tt:tt)*) => { $crate::klog!(Debug, $($tt)*) };
}

/// Convenience macro for TRACE level
#[macro_export]
macro_rules! ktrace {
    ($($tt:tt)*) => { $crate::klog!(Trace, $($tt)*) };
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_gate() {
        set_level(Level::Info);
        assert!(is_enabled(Level::Error));
        assert!(is_enabled(Level::Info));
        assert!(!is_enabled(Level::Debug));
        assert!(!is_enabled(Level::Trace));

        set_level(Level::Trace);
        assert!(is_enabled(Level::Trace));
        set_level(Level::Info);
    }

    #[test]
    fn test_level_from_u8() {
        assert_eq!(Level::from_u8(0), Some(Level::Error));
        assert_eq!(Level::from_u8(4), Some(Level::Trace));
        assert_eq!(Level::from_u8(5), None);
    }

    #[test]
    fn test_macros_compile() {
        kinfo!("test", "plain");
        kdebug!("test", "kvs"; a = 1, b = 2u64);
    }
}
