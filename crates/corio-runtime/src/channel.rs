//! # Per-fd event channel
//!
//! A [`Channel`] is the bookkeeping record for one file descriptor: the
//! epoll interest mask, the coroutine parked on it (if any), plain
//! callbacks for reactor-thread dispatch, and the reactor it is currently
//! registered with.
//!
//! ```text
//!   hook/timer                 Channel                    Reactor
//!   ----------                 -------                    -------
//!   set_coroutine(co)   -->   coroutine slot
//!   add_listen_events   -->   mask |= ev  ------------>  add_event(fd, mask)
//!   del_listen_events   -->   mask &= !ev ------------>  add_event(fd, mask)
//!   unregister          -->   mask = 0    ------------>  del_event(fd)
//! ```
//!
//! Channels are handed out by the process-wide [`ChannelTable`], one slot
//! per fd, so every part of the runtime that touches an fd sees the same
//! record.

use crate::coroutine::Coroutine;
use crate::last_errno;
use crate::reactor::Reactor;

use corio_core::{cdebug, cerror};

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

/// Readable interest, as an epoll mask bit.
pub const READ: u32 = libc::EPOLLIN as u32;
/// Writable interest, as an epoll mask bit.
pub const WRITE: u32 = libc::EPOLLOUT as u32;

type EventFn = dyn Fn() + Send + Sync;

/// State attached to one file descriptor.
pub struct Channel {
    fd: RawFd,
    listen_events: AtomicU32,
    coroutine: Mutex<Option<Arc<Coroutine>>>,
    read_cb: Mutex<Option<Arc<EventFn>>>,
    write_cb: Mutex<Option<Arc<EventFn>>>,
    reactor: Mutex<Option<Arc<Reactor>>>,
}

impl Channel {
    pub fn new(fd: RawFd) -> Self {
        Channel {
            fd,
            listen_events: AtomicU32::new(0),
            coroutine: Mutex::new(None),
            read_cb: Mutex::new(None),
            write_cb: Mutex::new(None),
            reactor: Mutex::new(None),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Current epoll interest mask.
    pub fn listen_events(&self) -> u32 {
        self.listen_events.load(Ordering::Acquire)
    }

    /// Add interest bits and push the new mask to the reactor. Binds the
    /// channel to the calling thread's reactor if it has none yet.
    pub fn add_listen_events(self: &Arc<Self>, events: u32) {
        let old = self.listen_events.fetch_or(events, Ordering::AcqRel);
        if old & events == events {
            cdebug!("fd {} already listening for {:#x}, skip", self.fd, events);
            return;
        }
        self.update_to_reactor();
    }

    /// Remove interest bits. The fd stays registered even with an empty
    /// mask; [`Channel::unregister`] takes it out of the reactor.
    pub fn del_listen_events(self: &Arc<Self>, events: u32) {
        let old = self.listen_events.fetch_and(!events, Ordering::AcqRel);
        if old & events == 0 {
            cdebug!("fd {} not listening for {:#x}, skip", self.fd, events);
            return;
        }
        self.update_to_reactor();
    }

    fn update_to_reactor(self: &Arc<Self>) {
        let reactor = {
            let mut slot = self.reactor.lock().unwrap();
            match &*slot {
                Some(r) => r.clone(),
                None => {
                    let r = Reactor::current();
                    *slot = Some(r.clone());
                    r
                }
            }
        };
        let mask = self.listen_events.load(Ordering::Acquire);
        reactor.add_event(self.fd, mask);
    }

    /// Drop the fd from its reactor and forget the mask and callbacks.
    pub fn unregister(self: &Arc<Self>) {
        let reactor = {
            let mut slot = self.reactor.lock().unwrap();
            match &*slot {
                Some(r) => r.clone(),
                None => {
                    let r = Reactor::current();
                    *slot = Some(r.clone());
                    r
                }
            }
        };
        reactor.del_event(self.fd);
        self.listen_events.store(0, Ordering::Release);
        *self.read_cb.lock().unwrap() = None;
        *self.write_cb.lock().unwrap() = None;
        // The fd number will be reused; the next owner binds to its own
        // thread's reactor.
        self.clear_reactor();
    }

    /// Park a coroutine on this fd. The reactor resumes it when the fd
    /// fires.
    pub fn set_coroutine(&self, co: Arc<Coroutine>) {
        *self.coroutine.lock().unwrap() = Some(co);
    }

    pub fn coroutine(&self) -> Option<Arc<Coroutine>> {
        self.coroutine.lock().unwrap().clone()
    }

    pub fn clear_coroutine(&self) {
        *self.coroutine.lock().unwrap() = None;
    }

    pub fn set_read_callback<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.read_cb.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn read_callback(&self) -> Option<Arc<EventFn>> {
        self.read_cb.lock().unwrap().clone()
    }

    pub fn set_write_callback<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.write_cb.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn write_callback(&self) -> Option<Arc<EventFn>> {
        self.write_cb.lock().unwrap().clone()
    }

    pub fn set_reactor(&self, reactor: Arc<Reactor>) {
        *self.reactor.lock().unwrap() = Some(reactor);
    }

    pub fn reactor(&self) -> Option<Arc<Reactor>> {
        self.reactor.lock().unwrap().clone()
    }

    pub fn clear_reactor(&self) {
        *self.reactor.lock().unwrap() = None;
    }

    /// Switch the fd to O_NONBLOCK if it is not already.
    pub fn set_nonblock(&self) {
        unsafe {
            let flags = libc::fcntl(self.fd, libc::F_GETFL, 0);
            if flags < 0 {
                cerror!("fcntl(F_GETFL) failed on fd {}, errno {}", self.fd, last_errno());
                return;
            }
            if flags & libc::O_NONBLOCK != 0 {
                return;
            }
            if libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                cerror!("fcntl(F_SETFL) failed on fd {}, errno {}", self.fd, last_errno());
            }
        }
    }

    pub fn is_nonblock(&self) -> bool {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL, 0) };
        flags >= 0 && flags & libc::O_NONBLOCK != 0
    }
}

/// Process-wide fd -> [`Channel`] map. Slots are created eagerly so that
/// lookups after the first are a read-locked index.
pub struct ChannelTable {
    slots: RwLock<Vec<Arc<Channel>>>,
}

const INITIAL_TABLE_SIZE: usize = 1000;

static TABLE: OnceLock<ChannelTable> = OnceLock::new();

impl ChannelTable {
    fn with_capacity(n: usize) -> Self {
        let mut slots = Vec::with_capacity(n);
        for fd in 0..n {
            slots.push(Arc::new(Channel::new(fd as RawFd)));
        }
        ChannelTable {
            slots: RwLock::new(slots),
        }
    }

    pub fn global() -> &'static ChannelTable {
        TABLE.get_or_init(|| ChannelTable::with_capacity(INITIAL_TABLE_SIZE))
    }

    /// The channel for `fd`, growing the table by 1.5x when the fd is
    /// past the end.
    pub fn get(&self, fd: RawFd) -> Arc<Channel> {
        assert!(fd >= 0, "channel lookup with negative fd {fd}");
        let idx = fd as usize;
        {
            let slots = self.slots.read().unwrap();
            if idx < slots.len() {
                return slots[idx].clone();
            }
        }
        let mut slots = self.slots.write().unwrap();
        if idx >= slots.len() {
            let new_len = ((idx + 1) * 3 / 2).max(slots.len());
            for fd in slots.len()..new_len {
                slots.push(Arc::new(Channel::new(fd as RawFd)));
            }
        }
        slots[idx].clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.read().unwrap().len()
    }
}
