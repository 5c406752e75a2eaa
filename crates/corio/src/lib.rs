//! # corio - Coroutine I/O Runtime
//!
//! Stackful coroutines multiplexed over per-thread epoll reactors.
//!
//! - **Coroutines**: pooled, arena-backed fixed stacks, hand-written
//!   x86_64 context switch
//! - **Reactors**: one epoll loop per thread; a Main loop accepts and
//!   hands connections to Sub loops
//! - **Hooked I/O**: `read`/`write`/`accept`/`connect`/`sleep` park the
//!   calling coroutine instead of the thread
//! - **Timers**: timerfd-backed deadline map plus a coarse time wheel
//!   for idle-connection cleanup
//! - **Sync**: coroutine-aware mutex with FIFO ownership hand-off
//!
//! ## Quick start
//!
//! ```ignore
//! use corio::{init, CoTcpListener, IoThreadPool, RuntimeConfig};
//!
//! fn main() {
//!     init(RuntimeConfig::from_env()).unwrap();
//!
//!     let mut workers = IoThreadPool::new(4);
//!     workers.start();
//!
//!     let listener = CoTcpListener::bind(8080).unwrap();
//!     let accept = corio::spawn(move || loop {
//!         let stream = listener.accept().unwrap();
//!         // hand the connection to a worker...
//!     });
//!     corio::resume(&accept);
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        User Code                            │
//! │        CoTcpListener / CoTcpStream, CoMutex, sleep          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Hooked syscalls                        │
//! │      try once → register interest → yield → retry           │
//! └─────────────────────────────────────────────────────────────┘
//!               │                              │
//!               ▼                              ▼
//!    ┌────────────────────┐        ┌────────────────────────┐
//!    │   Main reactor     │ queue  │      Sub reactors      │
//!    │  (accept thread)   │──────▶ │   (IoThreadPool × N)   │
//!    └────────────────────┘        └────────────────────────┘
//!               │                              │
//!               └──────────────┬───────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │                    Coroutine pool                       │
//!    │       fixed stacks carved from mmap'd arenas            │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Core types
pub use corio_core::{CoroutineId, RunContext};
pub use corio_core::{MemoryError, NetError, RtResult, RuntimeError};

// Logging macros and controls
pub use corio_core::klog::{self, set_flush_enabled, set_log_level, set_thread_tag, LogLevel};
pub use corio_core::{cdebug, cerror, cinfo, cprint, cprintln, ctrace, cwarn};

// Env + clock helpers
pub use corio_core::{env_get, env_get_bool, env_get_opt, now_ms};

// Runtime surface
pub use corio_runtime::{
    init, is_hook_enabled, is_main_coroutine, resume, set_hook, sleep, yield_now, CoMutex,
    CoMutexGuard, CoTcpListener, CoTcpStream, Coroutine, CoroutinePool, IoThread, IoThreadPool,
    Reactor, ReactorKind, RuntimeConfig, Slot, TimeWheel, Timer, TimerEvent,
};

use std::sync::Arc;

/// The installed runtime config (env defaults if [`init`] never ran).
pub fn config() -> &'static RuntimeConfig {
    corio_runtime::config::get()
}

/// Arm a pooled coroutine with `f` and queue it on the calling thread's
/// reactor.
///
/// The coroutine stays checked out of the pool until the caller hands it
/// back with [`CoroutinePool::return_coroutine`]; per-connection servers
/// normally do that from the coroutine's own reactor once the body ends.
pub fn spawn<F>(f: F) -> Arc<Coroutine>
where
    F: FnOnce() + Send + 'static,
{
    let co = CoroutinePool::global().get_coroutine();
    co.set_callback(Box::new(f));
    Reactor::current().add_coroutine(co.clone());
    co
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_runs_on_this_loop() {
        let (tx, rx) = std::sync::mpsc::channel();
        let co = spawn(move || {
            tx.send(std::thread::current().id()).unwrap();
            Reactor::current().stop();
        });

        // queued before loop entry; the first tick resumes it, the body
        // stops the loop and loop_run returns
        Reactor::current().loop_run();

        let seen = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(seen, std::thread::current().id());
        CoroutinePool::global().return_coroutine(&co);
    }
}
