//! # corio-core
//!
//! Core types for the corio coroutine runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! All platform-specific pieces (context switch, stacks, reactor) live
//! in `corio-runtime`.
//!
//! ## Modules
//!
//! - `id` - Coroutine identifier type
//! - `runctx` - Per-coroutine request context (msg id, method)
//! - `error` - Error types
//! - `klog` - Leveled stderr logging macros
//! - `env` - Environment variable helpers
//! - `time` - Monotonic millisecond clock

pub mod env;
pub mod error;
pub mod id;
pub mod klog;
pub mod runctx;
pub mod time;

// Re-exports for convenience
pub use env::{env_get, env_get_bool, env_get_opt};
pub use error::{MemoryError, NetError, RtResult, RuntimeError};
pub use id::CoroutineId;
pub use klog::{set_log_level, LogLevel};
pub use runctx::RunContext;
pub use time::now_ms;

/// Shared constants
pub mod constants {
    /// Default coroutine stack size (128 KiB)
    pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

    /// Smallest stack the pool will accept
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Default primary pool size
    pub const DEFAULT_POOL_SIZE: usize = 100;
}
