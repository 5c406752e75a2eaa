//! # Timerfd-backed deadlines
//!
//! One [`Timer`] per reactor, created lazily by `Reactor::timer`. Pending
//! deadlines live in an ordered multiset keyed by `(arrive ms, seq)`; the
//! timerfd is always programmed for the earliest entry and the reactor
//! runs [`Timer::on_fire`] inline when the fd reads ready.
//!
//! A [`TimerEvent`] is shared as `Arc`; cancel and reschedule mutate it in
//! place, so a handle kept by the caller stays authoritative even while
//! the event sits in the set.

use crate::channel::{self, ChannelTable};
use crate::last_errno;
use crate::reactor::Reactor;

use corio_core::time::now_ms;
use corio_core::{cdebug, cerror};

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type TimerTask = Box<dyn Fn() + Send + Sync>;

/// A deadline with a callback, one-shot or repeating.
pub struct TimerEvent {
    arrive_ms: AtomicI64,
    interval_ms: i64,
    repeated: AtomicBool,
    canceled: AtomicBool,
    task: TimerTask,
}

impl TimerEvent {
    /// Fires `interval_ms` from now, then every `interval_ms` if
    /// `repeated`.
    pub fn new<F>(interval_ms: i64, repeated: bool, task: F) -> Arc<TimerEvent>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let arrive = now_ms() + interval_ms;
        cdebug!("timer event will fire at {} ms", arrive);
        Arc::new(TimerEvent {
            arrive_ms: AtomicI64::new(arrive),
            interval_ms,
            repeated: AtomicBool::new(repeated),
            canceled: AtomicBool::new(false),
            task: Box::new(task),
        })
    }

    pub fn arrive_ms(&self) -> i64 {
        self.arrive_ms.load(Ordering::Acquire)
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    pub fn is_repeated(&self) -> bool {
        self.repeated.load(Ordering::Acquire)
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Move the deadline to now + interval. A canceled event stays
    /// canceled; [`TimerEvent::wake`] revives it.
    pub fn reset_time(&self) {
        self.arrive_ms.store(now_ms() + self.interval_ms, Ordering::Release);
    }

    pub fn wake(&self) {
        self.canceled.store(false, Ordering::Release);
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn cancel_repeated(&self) {
        self.repeated.store(false, Ordering::Release);
    }

    fn run(&self) {
        (self.task)();
    }
}

pub struct Timer {
    fd: RawFd,
    pending: Mutex<BTreeMap<(i64, u64), Arc<TimerEvent>>>,
    seq: AtomicU64,
}

impl Timer {
    /// Creates the timerfd and registers it on `reactor` as a plain read
    /// callback channel.
    pub(crate) fn new(reactor: &Arc<Reactor>) -> Arc<Timer> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            cerror!("timerfd_create failed, errno {}; cannot run timers", last_errno());
            std::process::abort();
        }
        cdebug!("timer fd {}", fd);
        let timer = Arc::new(Timer {
            fd,
            pending: Mutex::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
        });
        let ch = ChannelTable::global().get(fd);
        ch.set_reactor(reactor.clone());
        let inner = timer.clone();
        ch.set_read_callback(move || inner.on_fire());
        ch.add_listen_events(channel::READ);
        timer
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn add_timer_event(&self, event: Arc<TimerEvent>) {
        self.add_timer_event_inner(event, true);
    }

    fn add_timer_event_inner(&self, event: Arc<TimerEvent>, need_reset: bool) {
        let arrive = event.arrive_ms();
        let is_earliest = {
            let mut pending = self.pending.lock().unwrap();
            let is_earliest = match pending.keys().next() {
                None => true,
                Some(&(first, _)) => arrive < first,
            };
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            pending.insert((arrive, seq), event);
            is_earliest
        };
        if is_earliest && need_reset {
            cdebug!("new earliest deadline, reprogramming");
            self.reset_arrive_time();
        }
    }

    /// Cancel `event` and drop it from the set if it is still queued.
    pub fn del_timer_event(&self, event: &Arc<TimerEvent>) {
        event.cancel();
        let arrive = event.arrive_ms();
        let mut pending = self.pending.lock().unwrap();
        let key = pending
            .range((arrive, 0)..=(arrive, u64::MAX))
            .find(|(_, queued)| Arc::ptr_eq(queued, event))
            .map(|(&key, _)| key);
        if let Some(key) = key {
            pending.remove(&key);
            cdebug!("deleted timer event, arrive {} ms", arrive);
        }
    }

    /// Program the fd for the earliest pending deadline.
    fn reset_arrive_time(&self) {
        let first = {
            let pending = self.pending.lock().unwrap();
            pending.keys().next().map(|&(arrive, _)| arrive)
        };
        let first = match first {
            Some(first) => first,
            None => {
                cdebug!("no timer events pending");
                return;
            }
        };
        // a zero it_value would disarm the fd, so an already-due deadline
        // is programmed 1 ms out
        let mut delta = first - now_ms();
        if delta <= 0 {
            delta = 1;
        }
        let mut spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        spec.it_value.tv_sec = delta / 1000;
        spec.it_value.tv_nsec = (delta % 1000) * 1_000_000;
        if unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) } != 0 {
            cerror!("timerfd_settime for {} ms failed, errno {}", delta, last_errno());
        }
    }

    /// Drain the fd, pull out everything due, put repeating events back
    /// with fresh deadlines, then run the callbacks outside the lock.
    pub fn on_fire(&self) {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
            if n != 8 {
                break;
            }
        }

        let now = now_ms();
        let mut due: Vec<Arc<TimerEvent>> = Vec::new();
        {
            let mut pending = self.pending.lock().unwrap();
            loop {
                let front_due =
                    matches!(pending.keys().next(), Some(&(arrive, _)) if arrive <= now);
                if !front_due {
                    break;
                }
                if let Some((_, event)) = pending.pop_first() {
                    if !event.is_canceled() {
                        due.push(event);
                    }
                }
            }
        }

        // repeating events are back in the set before any callback runs,
        // so a callback that inspects the timer sees itself rescheduled
        for event in &due {
            if event.is_repeated() && !event.is_canceled() {
                event.reset_time();
                self.add_timer_event_inner(event.clone(), false);
            }
        }
        self.reset_arrive_time();

        for event in &due {
            // a cancel can land between the pop above and this point
            if !event.is_canceled() {
                event.run();
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
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
        while !reactor.is_looping() {
            std::thread::sleep(Duration::from_millis(1));
        }
        (reactor, handle)
    }

    #[test]
    fn test_event_flags() {
        let ev = TimerEvent::new(1000, true, || {});
        assert_eq!(ev.interval_ms(), 1000);
        assert!(ev.is_repeated());
        assert!(!ev.is_canceled());
        ev.cancel();
        assert!(ev.is_canceled());
        ev.wake();
        assert!(!ev.is_canceled());
        ev.cancel_repeated();
        assert!(!ev.is_repeated());

        let before = ev.arrive_ms();
        std::thread::sleep(Duration::from_millis(5));
        ev.reset_time();
        assert!(ev.arrive_ms() >= before);
    }

    #[test]
    fn test_deadlines_fire_in_order_skipping_canceled() {
        let (reactor, handle) = spawn_loop();
        let timer = reactor.timer();

        let (tx, rx) = mpsc::channel();
        let tx1 = tx.clone();
        let tx2 = tx.clone();
        let tx3 = tx;
        let e1 = TimerEvent::new(40, false, move || tx1.send(1).unwrap());
        let e2 = TimerEvent::new(80, false, move || tx2.send(2).unwrap());
        let e3 = TimerEvent::new(120, false, move || tx3.send(3).unwrap());
        timer.add_timer_event(e1);
        timer.add_timer_event(e2.clone());
        timer.add_timer_event(e3);
        timer.del_timer_event(&e2);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 3);
        // the canceled one stays quiet
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        reactor.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_repeating_event_fires_until_deleted() {
        let (reactor, handle) = spawn_loop();
        let timer = reactor.timer();

        let (tx, rx) = mpsc::channel();
        let ev = TimerEvent::new(20, true, move || {
            let _ = tx.send(());
        });
        timer.add_timer_event(ev.clone());

        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        timer.del_timer_event(&ev);

        // one fire may already be in flight; after it lands the stream
        // must go quiet
        std::thread::sleep(Duration::from_millis(100));
        while rx.try_recv().is_ok() {}
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        reactor.stop();
        handle.join().unwrap();
    }
}
