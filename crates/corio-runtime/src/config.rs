//! Runtime configuration
//!
//! Library defaults with environment overrides, validated before use and
//! installed process-wide once.
//!
//! # Example
//!
//! ```rust,ignore
//! use corio_runtime::config::RuntimeConfig;
//!
//! // Defaults + env overrides
//! let cfg = RuntimeConfig::from_env();
//!
//! // Or programmatic
//! let cfg = RuntimeConfig::new().io_threads(8).pool_size(500);
//! corio_runtime::config::install(cfg);
//! ```

use corio_core::constants::{DEFAULT_POOL_SIZE, DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
use corio_core::env::env_get;
use corio_core::error::{RtResult, RuntimeError};
use corio_core::{cdebug, cwarn};

use std::sync::OnceLock;

/// Tunables consumed by the pool, reactors, hooks and time wheel.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Bytes per coroutine stack
    pub stack_size: usize,
    /// Pre-created coroutines (also blocks per stack arena)
    pub pool_size: usize,
    /// Worker reactor threads in an [`IoThreadPool`](crate::io_thread::IoThreadPool)
    pub io_threads: usize,
    /// Idle-connection wheel: bucket count
    pub wheel_buckets: usize,
    /// Idle-connection wheel: seconds per tick
    pub wheel_interval_s: u64,
    /// Hooked connect() gives up after this many milliseconds
    pub connect_timeout_ms: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `CORIO_STACK_SIZE` - bytes per coroutine stack
    /// - `CORIO_POOL_SIZE` - pre-created coroutines
    /// - `CORIO_IO_THREADS` - worker reactor threads
    /// - `CORIO_WHEEL_BUCKETS` - idle wheel bucket count
    /// - `CORIO_WHEEL_INTERVAL_S` - idle wheel tick seconds
    /// - `CORIO_CONNECT_TIMEOUT_MS` - hooked connect timeout
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("CORIO_STACK_SIZE", DEFAULT_STACK_SIZE),
            pool_size: env_get("CORIO_POOL_SIZE", DEFAULT_POOL_SIZE),
            io_threads: env_get("CORIO_IO_THREADS", 4),
            wheel_buckets: env_get("CORIO_WHEEL_BUCKETS", 6),
            wheel_interval_s: env_get("CORIO_WHEEL_INTERVAL_S", 10),
            connect_timeout_ms: env_get("CORIO_CONNECT_TIMEOUT_MS", 75_000),
        }
    }

    /// Plain defaults, no env lookups. Useful in tests.
    pub fn new() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
            io_threads: 4,
            wheel_buckets: 6,
            wheel_interval_s: 10,
            connect_timeout_ms: 75_000,
        }
    }

    /// Set bytes per coroutine stack
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Set the number of pre-created coroutines
    pub fn pool_size(mut self, n: usize) -> Self {
        self.pool_size = n;
        self
    }

    /// Set the number of worker reactor threads
    pub fn io_threads(mut self, n: usize) -> Self {
        self.io_threads = n;
        self
    }

    /// Set the idle wheel bucket count
    pub fn wheel_buckets(mut self, n: usize) -> Self {
        self.wheel_buckets = n;
        self
    }

    /// Set the idle wheel tick length in seconds
    pub fn wheel_interval_s(mut self, secs: u64) -> Self {
        self.wheel_interval_s = secs;
        self
    }

    /// Set the hooked connect() timeout in milliseconds
    pub fn connect_timeout_ms(mut self, ms: i64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Reject configurations the runtime cannot run with.
    pub fn validate(&self) -> RtResult<()> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(RuntimeError::InvalidConfig("stack_size must be >= 16 KiB"));
        }
        if self.pool_size == 0 {
            return Err(RuntimeError::InvalidConfig("pool_size must be > 0"));
        }
        if self.io_threads == 0 {
            return Err(RuntimeError::InvalidConfig("io_threads must be > 0"));
        }
        if self.wheel_buckets == 0 {
            return Err(RuntimeError::InvalidConfig("wheel_buckets must be > 0"));
        }
        if self.wheel_interval_s == 0 {
            return Err(RuntimeError::InvalidConfig("wheel_interval_s must be > 0"));
        }
        if self.connect_timeout_ms <= 0 {
            return Err(RuntimeError::InvalidConfig("connect_timeout_ms must be > 0"));
        }
        Ok(())
    }

    /// Dump every field at debug level
    pub fn print(&self) {
        cdebug!("corio configuration:");
        cdebug!("  stack_size:         {}", self.stack_size);
        cdebug!("  pool_size:          {}", self.pool_size);
        cdebug!("  io_threads:         {}", self.io_threads);
        cdebug!("  wheel_buckets:      {}", self.wheel_buckets);
        cdebug!("  wheel_interval_s:   {}", self.wheel_interval_s);
        cdebug!("  connect_timeout_ms: {}", self.connect_timeout_ms);
    }
}

static GLOBAL: OnceLock<RuntimeConfig> = OnceLock::new();

/// Install the process-wide configuration. Validates first. A second call
/// is a logged no-op since the pool and reactors may already hold the
/// first values.
pub fn install(cfg: RuntimeConfig) -> RtResult<()> {
    cfg.validate()?;
    cfg.print();
    if GLOBAL.set(cfg).is_err() {
        cwarn!("runtime config already installed; ignoring");
    }
    Ok(())
}

/// The installed configuration, falling back to [`RuntimeConfig::from_env`]
/// on first use.
pub fn get() -> &'static RuntimeConfig {
    GLOBAL.get_or_init(RuntimeConfig::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env_defaults_validate() {
        let cfg = RuntimeConfig::from_env();
        assert!(cfg.validate().is_ok());
        assert!(cfg.pool_size >= 1);
    }

    #[test]
    fn test_builder() {
        let cfg = RuntimeConfig::new()
            .io_threads(8)
            .pool_size(500)
            .wheel_interval_s(2);
        assert_eq!(cfg.io_threads, 8);
        assert_eq!(cfg.pool_size, 500);
        assert_eq!(cfg.wheel_interval_s, 2);
    }

    #[test]
    fn test_validation_rejects() {
        assert!(RuntimeConfig::new().stack_size(1024).validate().is_err());
        assert!(RuntimeConfig::new().pool_size(0).validate().is_err());
        assert!(RuntimeConfig::new().io_threads(0).validate().is_err());
        assert!(RuntimeConfig::new().connect_timeout_ms(0).validate().is_err());
    }
}
