//! Leveled stderr logging for the coroutine runtime
//!
//! Thread-safe, optionally-flushing output with a per-thread context stamp
//! (thread tag + current coroutine id) so interleaved reactor logs stay
//! readable.
//!
//! # Environment Variables
//!
//! - `CORIO_FLUSH_EPRINT=1` - Flush stderr after each line (crash debugging)
//! - `CORIO_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace (or 0-5)
//!
//! # Usage
//!
//! ```ignore
//! use corio_core::{cinfo, cdebug, cwarn, cerror};
//!
//! cinfo!("io thread {} started", idx);
//! cdebug!("fd {} registered for {:#x}", fd, mask);
//! cwarn!("unexpected event mask {:#x}", mask);
//! cerror!("epoll_create1 failed: {}", err);
//! ```

use std::cell::Cell;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels (matches common conventions)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

// Global configuration (initialized once)
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

thread_local! {
    // Stamped into every leveled line. Tag is set once per thread
    // (io threads name themselves); the coroutine id follows resume/yield.
    static THREAD_TAG: Cell<&'static str> = const { Cell::new("") };
    static CONTEXT_ID: Cell<u32> = const { Cell::new(u32::MAX) };
}

/// Initialize logging from environment variables
///
/// Called automatically on first log, but can be called explicitly for
/// deterministic initialization.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return; // Already initialized
    }

    if let Ok(val) = std::env::var("CORIO_FLUSH_EPRINT") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("CORIO_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Info,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

/// Check if flush is enabled
#[inline]
pub fn flush_enabled() -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

/// Get current log level
#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level programmatically
pub fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Set flush mode programmatically
pub fn set_flush_enabled(enabled: bool) {
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Check if a log level is enabled
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

/// Name the calling thread in log lines ("main", "corio-io-2", ...)
pub fn set_thread_tag(tag: &'static str) {
    THREAD_TAG.with(|t| t.set(tag));
}

/// Record the coroutine id running on this thread (u32::MAX clears it)
#[inline]
pub fn set_context_id(id: u32) {
    CONTEXT_ID.with(|c| c.set(id));
}

/// Drop the coroutine id from subsequent log lines
#[inline]
pub fn clear_context_id() {
    CONTEXT_ID.with(|c| c.set(u32::MAX));
}

/// Internal: Write and optionally flush
///
/// Uses a lock on stderr to ensure atomic line output.
#[doc(hidden)]
pub fn _cprint_impl(args: std::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_fmt(args);
    if flush_enabled() {
        let _ = handle.flush();
    }
}

/// Internal: Write with newline and optionally flush
#[doc(hidden)]
pub fn _cprintln_impl(args: std::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if flush_enabled() {
        let _ = handle.flush();
    }
}

/// Internal: Leveled print with the thread/coroutine context stamp
#[doc(hidden)]
pub fn _clog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let tag = THREAD_TAG.with(|t| t.get());
    let ctx = CONTEXT_ID.with(|c| c.get());
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{} ", level.prefix());
    if !tag.is_empty() {
        let _ = write!(handle, "[{}] ", tag);
    }
    if ctx != u32::MAX {
        let _ = write!(handle, "[co {}] ", ctx);
    }
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if flush_enabled() {
        let _ = handle.flush();
    }
}

// ============================================================================
// Public Macros
// ============================================================================

/// Print to stderr (no newline)
///
/// Like `eprint!` but with optional auto-flush and mutex protection.
#[macro_export]
macro_rules! cprint {
    ($($arg:tt)*) => {{
        $crate::klog::_cprint_impl(format_args!($($arg)*));
    }};
}

/// Print to stderr with newline
///
/// Like `eprintln!` but with optional auto-flush and mutex protection.
#[macro_export]
macro_rules! cprintln {
    () => {{
        $crate::klog::_cprintln_impl(format_args!(""));
    }};
    ($($arg:tt)*) => {{
        $crate::klog::_cprintln_impl(format_args!($($arg)*));
    }};
}

/// Error level log (always shown unless logging is off)
#[macro_export]
macro_rules! cerror {
    ($($arg:tt)*) => {{
        $crate::klog::_clog_impl(
            $crate::klog::LogLevel::Error,
            format_args!($($arg)*)
        );
    }};
}

/// Warning level log
#[macro_export]
macro_rules! cwarn {
    ($($arg:tt)*) => {{
        $crate::klog::_clog_impl(
            $crate::klog::LogLevel::Warn,
            format_args!($($arg)*)
        );
    }};
}

/// Info level log
#[macro_export]
macro_rules! cinfo {
    ($($arg:tt)*) => {{
        $crate::klog::_clog_impl(
            $crate::klog::LogLevel::Info,
            format_args!($($arg)*)
        );
    }};
}

/// Debug level log
#[macro_export]
macro_rules! cdebug {
    ($($arg:tt)*) => {{
        $crate::klog::_clog_impl(
            $crate::klog::LogLevel::Debug,
            format_args!($($arg)*)
        );
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! ctrace {
    ($($arg:tt)*) => {{
        $crate::klog::_clog_impl(
            $crate::klog::LogLevel::Trace,
            format_args!($($arg)*)
        );
    }};
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_levels() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_level_from_u8() {
        assert_eq!(LogLevel::from_u8(0), LogLevel::Off);
        assert_eq!(LogLevel::from_u8(1), LogLevel::Error);
        assert_eq!(LogLevel::from_u8(4), LogLevel::Debug);
        assert_eq!(LogLevel::from_u8(99), LogLevel::Trace);
    }

    #[test]
    fn test_context_stamp_roundtrip() {
        set_context_id(7);
        CONTEXT_ID.with(|c| assert_eq!(c.get(), 7));
        clear_context_id();
        CONTEXT_ID.with(|c| assert_eq!(c.get(), u32::MAX));
    }

    #[test]
    fn test_macros_compile() {
        // Just verify macros compile - actual output tested manually
        set_log_level(LogLevel::Off); // Suppress output during test

        cprint!("test");
        cprintln!("test {}", 42);
        cerror!("error {}", "msg");
        cwarn!("warn");
        cinfo!("info");
        cdebug!("debug");
        ctrace!("trace");

        // the flush path of the unleveled prints
        set_flush_enabled(true);
        cprintln!("flushed {}", 1);
        set_flush_enabled(false);
    }
}
