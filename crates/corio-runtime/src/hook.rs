//! # Coroutine-aware I/O calls
//!
//! Drop-in equivalents of `read`/`write`/`accept`/`connect`/`sleep` that
//! park the calling coroutine instead of blocking the thread. Each call:
//!
//! ```text
//!   try the syscall once
//!     ready        -> return
//!     EAGAIN       -> register interest + current coroutine, yield
//!                     ... reactor resumes us when the fd fires ...
//!                     deregister, retry once, return
//!     other errno  -> return
//! ```
//!
//! Calls from a thread's main coroutine, or with the hooks switched off
//! via [`set_hook`], go straight to libc with untouched semantics. The fd
//! is flipped to `O_NONBLOCK` the first time a coroutine uses it.

use crate::channel::{self, Channel, ChannelTable};
use crate::config;
use crate::coroutine::{self, Coroutine};
use crate::last_errno;
use crate::reactor::Reactor;
use crate::timer::TimerEvent;

use corio_core::{cdebug, cerror, ctrace};

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static HOOK_ENABLED: AtomicBool = AtomicBool::new(true);

/// Globally enable or disable coroutine I/O interception.
pub fn set_hook(enabled: bool) {
    HOOK_ENABLED.store(enabled, Ordering::Release);
}

pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.load(Ordering::Acquire)
}

fn bypass() -> bool {
    !is_hook_enabled() || coroutine::is_main_coroutine()
}

fn would_block(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK
}

/// Bind the current coroutine to `ch` and register interest.
fn to_epoll(ch: &Arc<Channel>, events: u32) {
    let co = Coroutine::current();
    if events & channel::READ != 0 {
        cdebug!("fd {} registers read interest", ch.fd());
        ch.set_coroutine(co.clone());
        ch.add_listen_events(channel::READ);
    }
    if events & channel::WRITE != 0 {
        cdebug!("fd {} registers write interest", ch.fd());
        ch.set_coroutine(co.clone());
        ch.add_listen_events(channel::WRITE);
    }
}

/// The fd's channel, bound to the calling thread's reactor on first use.
fn prepare_channel(fd: RawFd) -> Arc<Channel> {
    let reactor = Reactor::current();
    let ch = ChannelTable::global().get(fd);
    if ch.reactor().is_none() {
        ch.set_reactor(reactor);
    }
    ch.set_nonblock();
    ch
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    ctrace!("hooked read, fd {}", fd);
    if bypass() {
        return unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    }
    let ch = prepare_channel(fd);

    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n >= 0 || !would_block(last_errno()) {
        return n;
    }

    to_epoll(&ch, channel::READ);
    ctrace!("read parks, fd {}", fd);
    coroutine::yield_now();

    ch.del_listen_events(channel::READ);
    ch.clear_coroutine();
    ctrace!("read resumed, fd {}", fd);
    unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) }
}

pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    ctrace!("hooked write, fd {}", fd);
    if bypass() {
        return unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    }
    let ch = prepare_channel(fd);

    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n >= 0 || !would_block(last_errno()) {
        return n;
    }

    to_epoll(&ch, channel::WRITE);
    ctrace!("write parks, fd {}", fd);
    coroutine::yield_now();

    ch.del_listen_events(channel::WRITE);
    ch.clear_coroutine();
    ctrace!("write resumed, fd {}", fd);
    unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) }
}

/// # Safety
///
/// `addr`/`addrlen` must be null or valid for the accepted peer address,
/// exactly as for `libc::accept`.
pub unsafe fn accept(
    sockfd: RawFd,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> i32 {
    ctrace!("hooked accept, fd {}", sockfd);
    if bypass() {
        return libc::accept(sockfd, addr, addrlen);
    }
    let ch = prepare_channel(sockfd);

    let n = libc::accept(sockfd, addr, addrlen);
    if n >= 0 || !would_block(last_errno()) {
        return n;
    }

    to_epoll(&ch, channel::READ);
    ctrace!("accept parks, fd {}", sockfd);
    coroutine::yield_now();

    ch.del_listen_events(channel::READ);
    ch.clear_coroutine();
    ctrace!("accept resumed, fd {}", sockfd);
    libc::accept(sockfd, addr, addrlen)
}

/// # Safety
///
/// `addr` must point to a valid address of length `addrlen`, exactly as
/// for `libc::connect`.
pub unsafe fn connect(
    sockfd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> i32 {
    ctrace!("hooked connect, fd {}", sockfd);
    if bypass() {
        return libc::connect(sockfd, addr, addrlen);
    }
    let reactor = Reactor::current();
    let ch = prepare_channel(sockfd);

    let n = libc::connect(sockfd, addr, addrlen);
    if n == 0 {
        cdebug!("connect succeeded immediately, fd {}", sockfd);
        return 0;
    }
    if last_errno() != libc::EINPROGRESS {
        cdebug!("connect failed, fd {}, errno {}", sockfd, last_errno());
        return n;
    }

    to_epoll(&ch, channel::WRITE);

    let timeout_ms = config::get().connect_timeout_ms;
    let timed_out = Arc::new(AtomicBool::new(false));
    let flag = timed_out.clone();
    let co = Coroutine::current();
    let event = TimerEvent::new(timeout_ms, false, move || {
        flag.store(true, Ordering::Release);
        coroutine::resume(&co);
    });
    let timer = reactor.timer();
    timer.add_timer_event(event.clone());

    coroutine::yield_now();

    // whichever of the fd and the timer lost the race is cleaned up here
    ch.del_listen_events(channel::WRITE);
    ch.clear_coroutine();
    timer.del_timer_event(&event);

    if timed_out.load(Ordering::Acquire) {
        cerror!("connect timed out after {} ms, fd {}", timeout_ms, sockfd);
        *libc::__errno_location() = libc::ETIMEDOUT;
        return -1;
    }

    let n = libc::connect(sockfd, addr, addrlen);
    if n == 0 || (n < 0 && last_errno() == libc::EISCONN) {
        cdebug!("connect completed, fd {}", sockfd);
        return 0;
    }
    cdebug!("connect failed after resume, fd {}, errno {}", sockfd, last_errno());
    -1
}

/// Suspend the calling coroutine for `seconds` without holding its
/// thread. Falls back to `libc::sleep` on a main coroutine.
pub fn sleep(seconds: u32) -> u32 {
    ctrace!("hooked sleep, {} s", seconds);
    if bypass() {
        return unsafe { libc::sleep(seconds) };
    }

    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    let co = Coroutine::current();
    let event = TimerEvent::new(seconds as i64 * 1000, false, move || {
        cdebug!("sleep deadline reached, resume");
        flag.store(true, Ordering::Release);
        coroutine::resume(&co);
    });
    Reactor::current().timer().add_timer_event(event);

    // a resume meant for some other wait must not end the sleep early
    while !done.load(Ordering::Acquire) {
        coroutine::yield_now();
    }
    0
}
