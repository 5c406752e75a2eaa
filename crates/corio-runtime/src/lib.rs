//! # corio-runtime
//!
//! Linux implementation of the corio coroutine runtime:
//!
//! - pooled stackful coroutines on arena-backed stacks (`pool`, `stack`,
//!   `coroutine`, `arch`)
//! - one epoll reactor per thread with timers and a connection
//!   time wheel (`reactor`, `timer`, `timewheel`, `channel`)
//! - hooked socket calls that park the calling coroutine (`hook`, `net`)
//! - coroutine-aware locking and an I/O thread pool (`comutex`,
//!   `io_thread`)
//!
//! Everything is built on epoll, eventfd and timerfd; the crate only
//! compiles for Linux on x86_64.

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("corio-runtime requires Linux (epoll, eventfd, timerfd)");
    }
}

pub mod arch;
pub mod channel;
pub mod comutex;
pub mod config;
pub mod coroutine;
pub mod hook;
pub mod io_thread;
pub mod net;
pub mod pool;
pub mod reactor;
pub mod stack;
pub mod timer;
pub mod timewheel;

pub use channel::{Channel, ChannelTable};
pub use comutex::{CoMutex, CoMutexGuard};
pub use config::RuntimeConfig;
pub use coroutine::{is_main_coroutine, resume, yield_now, Coroutine};
pub use hook::{is_hook_enabled, set_hook, sleep};
pub use io_thread::{IoThread, IoThreadPool};
pub use net::{CoTcpListener, CoTcpStream};
pub use pool::CoroutinePool;
pub use reactor::{Reactor, ReactorKind};
pub use timer::{Timer, TimerEvent};
pub use timewheel::{Slot, TimeWheel};

use corio_core::cwarn;
use corio_core::error::RtResult;
use corio_core::klog;

use std::sync::Once;

/// errno left by the last failed syscall on this thread.
#[inline]
pub(crate) fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

static INIT: Once = Once::new();

/// Process-wide setup: logging, runtime config, SIGPIPE disposition.
///
/// Call once from `main` before touching the runtime. Later calls are
/// no-ops; the config passed to the first call wins.
pub fn init(config: RuntimeConfig) -> RtResult<()> {
    let mut installed = Ok(());
    INIT.call_once(|| {
        klog::init();
        installed = config::install(config);
        // a dead peer must surface as EPIPE from write, not kill the process
        let ignore = unsafe {
            nix::sys::signal::signal(
                nix::sys::signal::Signal::SIGPIPE,
                nix::sys::signal::SigHandler::SigIgn,
            )
        };
        if let Err(e) = ignore {
            cwarn!("failed to ignore SIGPIPE: {}", e);
        }
    });
    installed
}
