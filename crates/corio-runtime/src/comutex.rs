//! # Coroutine-aware mutex
//!
//! A lock that parks the calling coroutine instead of its thread. Waiters
//! queue FIFO; unlock hands ownership straight to the head of the queue
//! and schedules its resume on the unlocker's reactor, so the lock is
//! never observably free while someone waits.
//!
//! Main coroutines have no way to park. Locking from one is a logged
//! error that degrades to a spin acquire; it works, but it holds the
//! whole thread.

use crate::coroutine::{self, Coroutine};
use crate::reactor::Reactor;

use corio_core::{cdebug, cerror};

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

struct LockState {
    locked: bool,
    waiters: VecDeque<Arc<Coroutine>>,
}

pub struct CoMutex<T> {
    state: Mutex<LockState>,
    value: UnsafeCell<T>,
}

// value is only touched through a guard, and a guard only exists while
// the holder owns the lock
unsafe impl<T: Send> Send for CoMutex<T> {}
unsafe impl<T: Send> Sync for CoMutex<T> {}

impl<T> CoMutex<T> {
    pub fn new(value: T) -> CoMutex<T> {
        CoMutex {
            state: Mutex::new(LockState {
                locked: false,
                waiters: VecDeque::new(),
            }),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, parking the current coroutine while it is held
    /// elsewhere.
    pub fn lock(&self) -> CoMutexGuard<'_, T> {
        if coroutine::is_main_coroutine() {
            cerror!("coroutine mutex locked from a main coroutine, spinning");
            loop {
                {
                    let mut state = self.state.lock().unwrap();
                    if !state.locked {
                        state.locked = true;
                        return CoMutexGuard { mutex: self };
                    }
                }
                std::thread::yield_now();
            }
        }

        let co = Coroutine::current();
        {
            let mut state = self.state.lock().unwrap();
            if !state.locked {
                state.locked = true;
                cdebug!("coroutine {} acquired mutex", co.id());
                return CoMutexGuard { mutex: self };
            }
            state.waiters.push_back(co.clone());
            cdebug!(
                "coroutine {} waits for mutex, {} queued",
                co.id(),
                state.waiters.len()
            );
        }
        coroutine::yield_now();
        // only the unlock hand-off resumes us, and it left `locked` set
        // on our behalf
        CoMutexGuard { mutex: self }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    fn unlock(&self) {
        let next = {
            let mut state = self.state.lock().unwrap();
            match state.waiters.pop_front() {
                // ownership transfers, `locked` stays set
                Some(co) => Some(co),
                None => {
                    state.locked = false;
                    None
                }
            }
        };
        if let Some(co) = next {
            cdebug!("mutex handed to coroutine {}", co.id());
            Reactor::current().add_coroutine(co);
        }
    }
}

pub struct CoMutexGuard<'a, T> {
    mutex: &'a CoMutex<T>,
}

impl<T> Deref for CoMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for CoMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T> Drop for CoMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::CoroutinePool;
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
    fn test_uncontended_lock_unlock() {
        let (reactor, handle) = spawn_loop();
        let mutex = Arc::new(CoMutex::new(0u32));

        let (tx, rx) = mpsc::channel();
        let m = mutex.clone();
        let co = CoroutinePool::global().get_coroutine();
        co.set_callback(Box::new(move || {
            {
                let mut v = m.lock();
                *v += 1;
            }
            {
                let mut v = m.lock();
                *v += 10;
            }
            tx.send(()).unwrap();
        }));
        reactor.add_coroutine(co.clone());

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // loop thread is idle now; main-coroutine spin path reads safely
        assert_eq!(*mutex.lock(), 11);

        reactor.stop();
        handle.join().unwrap();
        CoroutinePool::global().return_coroutine(&co);
    }

    #[test]
    fn test_contended_handoff_is_fifo() {
        let (reactor, handle) = spawn_loop();
        let order = Arc::new(CoMutex::new(Vec::<&'static str>::new()));
        let (done_tx, done_rx) = mpsc::channel();

        // holder takes the lock, parks mid-critical-section, finishes
        // after the others queued up
        let m = order.clone();
        let holder = CoroutinePool::global().get_coroutine();
        holder.set_callback(Box::new(move || {
            let mut v = m.lock();
            v.push("holder");
            coroutine::yield_now();
            v.push("holder-again");
        }));

        let m = order.clone();
        let second = CoroutinePool::global().get_coroutine();
        second.set_callback(Box::new(move || {
            m.lock().push("second");
        }));

        let m = order.clone();
        let done = done_tx.clone();
        let third = CoroutinePool::global().get_coroutine();
        third.set_callback(Box::new(move || {
            m.lock().push("third");
            done.send(()).unwrap();
        }));

        reactor.add_coroutine(holder.clone());
        reactor.add_coroutine(second.clone());
        reactor.add_coroutine(third.clone());

        // give second and third time to queue behind the parked holder
        std::thread::sleep(Duration::from_millis(100));
        reactor.add_coroutine(holder.clone());

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let got = order.lock().clone();
        assert_eq!(got, vec!["holder", "holder-again", "second", "third"]);

        reactor.stop();
        handle.join().unwrap();
        for co in [&holder, &second, &third] {
            CoroutinePool::global().return_coroutine(co);
        }
    }

    #[test]
    fn test_main_coroutine_degrades_to_spin() {
        let mutex = CoMutex::new(String::from("x"));
        {
            let mut v = mutex.lock();
            v.push('y');
        }
        assert_eq!(mutex.into_inner(), "xy");
    }
}
