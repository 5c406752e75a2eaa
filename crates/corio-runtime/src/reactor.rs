//! # Per-thread event loop
//!
//! One [`Reactor`] per thread, created lazily by [`Reactor::current`]. The
//! loop multiplexes an epoll set plus an eventfd used to interrupt
//! `epoll_wait` from other threads.
//!
//! Each pass through the loop:
//!
//! ```text
//!   1. resume the coroutine noted as ready last pass, if any
//!   2. Sub only: drain the global hand-off queue, resuming each parked
//!      coroutine on this thread
//!   3. swap out and run pending tasks
//!   4. epoll_wait (10 events, 10 s cap)
//!   5. dispatch: wake fd -> drain; error-only events -> deregister;
//!      coroutine channels -> note first / resume / hand off;
//!      callback channels -> run timer inline, queue the rest
//!   6. apply epoll ctl operations staged by other threads
//! ```
//!
//! A `Main` reactor is the accept loop; it resumes its single accept
//! coroutine inline and never touches the hand-off queue. `Sub` reactors
//! (the default) push extra ready channels to the queue so an idle worker
//! can pick them up.

use crate::channel::{self, Channel, ChannelTable};
use crate::coroutine::{self, Coroutine};
use crate::last_errno;
use crate::timer::Timer;

use corio_core::{cdebug, cerror, ctrace};
use crossbeam_queue::SegQueue;

use std::cell::OnceCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

const MAX_EVENTS: usize = 10;
const EPOLL_TIMEOUT_MS: libc::c_int = 10_000;

/// Role of a reactor thread.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReactorKind {
    /// Accept loop. Resumes its accept coroutine inline.
    Main = 1,
    /// Worker loop. Participates in the global hand-off queue.
    Sub = 2,
}

pub type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static CURRENT: OnceCell<Arc<Reactor>> = const { OnceCell::new() };
}

/// Channels whose coroutine is waiting for any worker to resume it.
static HANDOFF_QUEUE: OnceLock<SegQueue<Arc<Channel>>> = OnceLock::new();

fn handoff_queue() -> &'static SegQueue<Arc<Channel>> {
    HANDOFF_QUEUE.get_or_init(SegQueue::new)
}

pub struct Reactor {
    epoll_fd: RawFd,
    wake_fd: RawFd,
    tid: libc::pid_t,
    kind: AtomicU8,
    looping: AtomicBool,
    stop_flag: AtomicBool,
    // -1 until the lazy timer exists
    timer_fd: AtomicI32,
    in_loop_fds: Mutex<Vec<RawFd>>,
    pending_add: Mutex<HashMap<RawFd, u32>>,
    pending_del: Mutex<Vec<RawFd>>,
    pending_tasks: Mutex<Vec<Task>>,
    timer: OnceLock<Arc<Timer>>,
}

impl Reactor {
    /// The calling thread's reactor, created on first use.
    pub fn current() -> Arc<Reactor> {
        CURRENT.with(|cell| cell.get_or_init(Reactor::new).clone())
    }

    fn new() -> Arc<Reactor> {
        let epoll_fd = unsafe { libc::epoll_create1(0) };
        if epoll_fd < 0 {
            cerror!("epoll_create1 failed, errno {}; cannot run", last_errno());
            std::process::abort();
        }
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            cerror!("eventfd failed, errno {}; cannot run", last_errno());
            std::process::abort();
        }
        let tid = unsafe { libc::gettid() };
        let reactor = Arc::new(Reactor {
            epoll_fd,
            wake_fd,
            tid,
            kind: AtomicU8::new(ReactorKind::Sub as u8),
            looping: AtomicBool::new(false),
            stop_flag: AtomicBool::new(false),
            timer_fd: AtomicI32::new(-1),
            in_loop_fds: Mutex::new(Vec::new()),
            pending_add: Mutex::new(HashMap::new()),
            pending_del: Mutex::new(Vec::new()),
            pending_tasks: Mutex::new(Vec::new()),
            timer: OnceLock::new(),
        });
        reactor.add_wake_fd();
        cdebug!(
            "thread {} created reactor, epoll fd {}, wake fd {}",
            tid,
            epoll_fd,
            wake_fd
        );
        reactor
    }

    fn add_wake_fd(&self) {
        let mut ev = libc::epoll_event {
            events: channel::READ,
            u64: self.wake_fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, self.wake_fd, &mut ev) };
        if rc != 0 {
            cerror!("epoll_ctl add wake fd {} failed, errno {}", self.wake_fd, last_errno());
            return;
        }
        self.in_loop_fds.lock().unwrap().push(self.wake_fd);
    }

    pub fn kind(&self) -> ReactorKind {
        if self.kind.load(Ordering::Acquire) == ReactorKind::Main as u8 {
            ReactorKind::Main
        } else {
            ReactorKind::Sub
        }
    }

    pub fn set_kind(&self, kind: ReactorKind) {
        self.kind.store(kind as u8, Ordering::Release);
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.tid == unsafe { libc::gettid() }
    }

    pub fn tid(&self) -> libc::pid_t {
        self.tid
    }

    /// Register or update `fd` in the epoll set. Off-thread calls are
    /// staged and applied at the bottom of the next tick.
    pub fn add_event(&self, fd: RawFd, events: u32) {
        if fd < 0 {
            cerror!("add event with invalid fd {}", fd);
            return;
        }
        if self.is_in_loop_thread() {
            self.add_event_in_loop(fd, events);
            return;
        }
        self.pending_add.lock().unwrap().insert(fd, events);
        self.wakeup();
    }

    /// Remove `fd` from the epoll set, staged like [`Reactor::add_event`].
    pub fn del_event(&self, fd: RawFd) {
        if fd < 0 {
            cerror!("del event with invalid fd {}", fd);
            return;
        }
        if self.is_in_loop_thread() {
            self.del_event_in_loop(fd);
            return;
        }
        self.pending_del.lock().unwrap().push(fd);
        self.wakeup();
    }

    fn add_event_in_loop(&self, fd: RawFd, events: u32) {
        let mut fds = self.in_loop_fds.lock().unwrap();
        let known = fds.contains(&fd);
        let op = if known { libc::EPOLL_CTL_MOD } else { libc::EPOLL_CTL_ADD };
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) } != 0 {
            cerror!("epoll_ctl fd {} mask {:#x} failed, errno {}", fd, events, last_errno());
            return;
        }
        if !known {
            fds.push(fd);
        }
        ctrace!("epoll_ctl ok, fd {} mask {:#x}", fd, events);
    }

    fn del_event_in_loop(&self, fd: RawFd) {
        let mut fds = self.in_loop_fds.lock().unwrap();
        let pos = match fds.iter().position(|&x| x == fd) {
            Some(pos) => pos,
            None => {
                cdebug!("fd {} not in this loop", fd);
                return;
            }
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) } != 0 {
            cerror!("epoll_ctl del fd {} failed, errno {}", fd, last_errno());
        }
        fds.swap_remove(pos);
        ctrace!("epoll del ok, fd {}", fd);
    }

    /// Run `task` on the loop thread during its next tick.
    pub fn add_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending_tasks.lock().unwrap().push(Box::new(task));
        self.wakeup();
    }

    pub fn add_tasks(&self, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        self.pending_tasks.lock().unwrap().extend(tasks);
        self.wakeup();
    }

    /// Schedule a resume of `co` on the loop thread.
    pub fn add_coroutine(&self, co: Arc<Coroutine>) {
        self.add_task(move || coroutine::resume(&co));
    }

    /// The reactor's lazily created timer.
    pub fn timer(self: &Arc<Self>) -> Arc<Timer> {
        self.timer
            .get_or_init(|| {
                let timer = Timer::new(self);
                self.timer_fd.store(timer.fd(), Ordering::Release);
                timer
            })
            .clone()
    }

    /// Interrupt `epoll_wait`. A no-op unless the loop is running.
    pub fn wakeup(&self) {
        if !self.looping.load(Ordering::Acquire) {
            return;
        }
        let one: u64 = 1;
        let n = unsafe { libc::write(self.wake_fd, &one as *const u64 as *const libc::c_void, 8) };
        if n != 8 {
            cerror!("wakeup write to fd {} failed, errno {}", self.wake_fd, last_errno());
        }
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe { libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
            if n != 8 {
                break;
            }
        }
    }

    /// Run the event loop on the owner thread until [`Reactor::stop`].
    pub fn loop_run(self: &Arc<Self>) {
        if !self.is_in_loop_thread() {
            cerror!("loop_run called off the reactor's thread");
            return;
        }
        if self.looping.swap(true, Ordering::AcqRel) {
            cdebug!("reactor is already looping");
            return;
        }
        self.stop_flag.store(false, Ordering::Release);

        // Ready coroutine carried from the previous dispatch. The first
        // ready channel each tick is resumed here instead of going through
        // the hand-off queue.
        let mut first_ready: Option<Arc<Coroutine>> = None;

        while !self.stop_flag.load(Ordering::Acquire) {
            if let Some(co) = first_ready.take() {
                coroutine::resume(&co);
            }

            if self.kind() != ReactorKind::Main {
                while let Some(ch) = handoff_queue().pop() {
                    ch.set_reactor(self.clone());
                    if let Some(co) = ch.coroutine() {
                        coroutine::resume(&co);
                    }
                }
            }

            let tasks = std::mem::take(&mut *self.pending_tasks.lock().unwrap());
            for task in tasks {
                task();
            }

            let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    events.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    EPOLL_TIMEOUT_MS,
                )
            };
            if n < 0 {
                cerror!("epoll_wait failed, errno {}, skip", last_errno());
                continue;
            }

            for ev in &events[..n as usize] {
                let fd = ev.u64 as RawFd;
                let got = ev.events;

                if fd == self.wake_fd && got & channel::READ != 0 {
                    self.drain_wake();
                    continue;
                }
                if got & (channel::READ | channel::WRITE) == 0 {
                    cerror!("fd {} woke with unexpected events {:#x}, deregistering", fd, got);
                    self.del_event_in_loop(fd);
                    continue;
                }

                let ch = ChannelTable::global().get(fd);
                if let Some(co) = ch.coroutine() {
                    if first_ready.is_none() {
                        first_ready = Some(co);
                        continue;
                    }
                    if self.kind() == ReactorKind::Sub {
                        self.del_event_in_loop(fd);
                        ch.clear_reactor();
                        handoff_queue().push(ch);
                    } else {
                        // Main has a single accept coroutine; resume it and
                        // forget the duplicate note.
                        coroutine::resume(&co);
                        first_ready = None;
                    }
                } else {
                    if fd == self.timer_fd.load(Ordering::Acquire) {
                        if let Some(cb) = ch.read_callback() {
                            cb();
                        }
                        continue;
                    }
                    if got & channel::READ != 0 {
                        if let Some(cb) = ch.read_callback() {
                            self.pending_tasks.lock().unwrap().push(Box::new(move || cb()));
                        }
                    }
                    if got & channel::WRITE != 0 {
                        if let Some(cb) = ch.write_callback() {
                            self.pending_tasks.lock().unwrap().push(Box::new(move || cb()));
                        }
                    }
                }
            }

            let adds: Vec<(RawFd, u32)> = self.pending_add.lock().unwrap().drain().collect();
            for (fd, mask) in adds {
                self.add_event_in_loop(fd, mask);
            }
            let dels = std::mem::take(&mut *self.pending_del.lock().unwrap());
            for fd in dels {
                self.del_event_in_loop(fd);
            }
        }

        cdebug!("reactor loop end");
        self.looping.store(false, Ordering::Release);
    }

    /// Ask a running loop to exit. Idempotent; ignored when not looping.
    pub fn stop(&self) {
        if !self.stop_flag.load(Ordering::Acquire) && self.looping.load(Ordering::Acquire) {
            self.stop_flag.store(true, Ordering::Release);
            self.wakeup();
        }
    }

    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.wake_fd);
        }
        cdebug!("reactor on thread {} closed", self.tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn spawn_loop() -> (Arc<Reactor>, std::thread::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            let reactor = Reactor::current();
            tx.send(reactor.clone()).unwrap();
            reactor.loop_run();
        });
        let reactor = rx.recv().unwrap();
        // stop() is ignored until the loop is up
        while !reactor.is_looping() {
            std::thread::sleep(Duration::from_millis(1));
        }
        (reactor, handle)
    }

    #[test]
    fn test_foreign_task_runs_on_loop_thread() {
        let (reactor, handle) = spawn_loop();
        let (tx, rx) = mpsc::channel();
        let loop_tid = reactor.tid();
        reactor.add_task(move || {
            tx.send(unsafe { libc::gettid() }).unwrap();
        });
        let ran_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ran_on, loop_tid);
        assert!(!reactor.is_in_loop_thread());
        reactor.stop();
        handle.join().unwrap();
        assert!(!reactor.is_looping());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (reactor, handle) = spawn_loop();
        reactor.stop();
        reactor.stop();
        handle.join().unwrap();
        // stopping a stopped reactor stays a no-op
        reactor.stop();
        assert!(!reactor.is_looping());
    }

    #[test]
    fn test_callback_channel_dispatch() {
        let (reactor, handle) = spawn_loop();

        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rfd, wfd) = (fds[0], fds[1]);

        let (tx, rx) = mpsc::channel();
        let ch = ChannelTable::global().get(rfd);
        ch.set_reactor(reactor.clone());
        ch.set_read_callback(move || {
            let _ = tx.send(());
        });
        ch.add_listen_events(channel::READ);

        assert_eq!(unsafe { libc::write(wfd, b"x".as_ptr() as *const libc::c_void, 1) }, 1);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        ch.unregister();
        reactor.stop();
        handle.join().unwrap();
        unsafe {
            libc::close(rfd);
            libc::close(wfd);
        }
    }

    #[test]
    fn test_write_ready_dispatch() {
        let (reactor, handle) = spawn_loop();

        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rfd, wfd) = (fds[0], fds[1]);

        // An empty pipe's write end is writable straight away.
        let (tx, rx) = mpsc::channel();
        let ch = ChannelTable::global().get(wfd);
        ch.set_reactor(reactor.clone());
        ch.set_write_callback(move || {
            let _ = tx.send(unsafe { libc::gettid() });
        });
        ch.add_listen_events(channel::WRITE);

        let ran_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ran_on, reactor.tid());

        ch.unregister();
        reactor.stop();
        handle.join().unwrap();
        unsafe {
            libc::close(rfd);
            libc::close(wfd);
        }
    }

    #[test]
    fn test_task_batch_runs_in_order() {
        let (reactor, handle) = spawn_loop();
        let (tx, rx) = mpsc::channel();
        let first = tx.clone();
        reactor.add_tasks(vec![
            Box::new(move || first.send(1).unwrap()) as Task,
            Box::new(move || tx.send(2).unwrap()) as Task,
        ]);
        // One batch lands in one tick, so order holds.
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        reactor.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_default_kind_is_sub() {
        let (reactor, handle) = spawn_loop();
        assert_eq!(reactor.kind(), ReactorKind::Sub);
        reactor.set_kind(ReactorKind::Main);
        assert_eq!(reactor.kind(), ReactorKind::Main);
        reactor.set_kind(ReactorKind::Sub);
        reactor.stop();
        handle.join().unwrap();
    }
}
