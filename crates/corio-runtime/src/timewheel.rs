//! # Idle-eviction time wheel
//!
//! A fixed ring of buckets holding [`Slot`]s. A repeating timer event pops
//! the front bucket and pushes an empty one every interval; dropping a
//! bucket drops its slots, and a slot whose payload is still alive runs
//! its shutdown callback from `Drop`.
//!
//! ```text
//!   fresh(slot) ----------------------------v
//!   [ bucket 0 | bucket 1 | ... | bucket N-1 ]
//!        ^ popped every interval
//! ```
//!
//! Callers re-arm a payload by pushing a clone of its slot to the back:
//! an entry refreshed at least once per interval never dies, an idle one
//! dies between `interval` and `bucket_count * interval` after its last
//! refresh.

use crate::reactor::Reactor;
use crate::timer::TimerEvent;

use corio_core::cdebug;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

/// Holds a payload weakly; the last clone to drop runs the shutdown
/// callback if the payload has not already gone away.
pub struct Slot<T> {
    payload: Weak<T>,
    on_expire: Box<dyn Fn(Arc<T>) + Send + Sync>,
}

impl<T> Slot<T> {
    pub fn new<F>(payload: &Arc<T>, on_expire: F) -> Arc<Slot<T>>
    where
        F: Fn(Arc<T>) + Send + Sync + 'static,
    {
        Arc::new(Slot {
            payload: Arc::downgrade(payload),
            on_expire: Box::new(on_expire),
        })
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        if let Some(payload) = self.payload.upgrade() {
            (self.on_expire)(payload);
        }
    }
}

type Buckets<T> = Mutex<VecDeque<Vec<Arc<Slot<T>>>>>;

pub struct TimeWheel<T> {
    reactor: Arc<Reactor>,
    buckets: Arc<Buckets<T>>,
    event: Arc<TimerEvent>,
}

impl<T: Send + Sync + 'static> TimeWheel<T> {
    /// Seeds `bucket_count` empty buckets and starts a repeating tick
    /// every `interval_s` on the reactor's timer.
    pub fn new(reactor: &Arc<Reactor>, bucket_count: usize, interval_s: u64) -> TimeWheel<T> {
        Self::with_interval_ms(reactor, bucket_count, interval_s as i64 * 1000)
    }

    pub(crate) fn with_interval_ms(
        reactor: &Arc<Reactor>,
        bucket_count: usize,
        interval_ms: i64,
    ) -> TimeWheel<T> {
        let mut ring = VecDeque::with_capacity(bucket_count);
        for _ in 0..bucket_count {
            ring.push_back(Vec::new());
        }
        let buckets: Arc<Buckets<T>> = Arc::new(Mutex::new(ring));

        // the tick captures the buckets, not the wheel, so the wheel can
        // drop while the event is still queued
        let tick_buckets = buckets.clone();
        let event = TimerEvent::new(interval_ms, true, move || {
            cdebug!("time wheel tick, pop front bucket");
            let mut buckets = tick_buckets.lock().unwrap();
            buckets.pop_front();
            buckets.push_back(Vec::new());
        });
        reactor.timer().add_timer_event(event.clone());

        TimeWheel {
            reactor: reactor.clone(),
            buckets,
            event,
        }
    }

    /// Push `slot` into the back bucket, granting it a full rotation of
    /// lifetime.
    pub fn fresh(&self, slot: Arc<Slot<T>>) {
        cdebug!("fresh slot into back bucket");
        let mut buckets = self.buckets.lock().unwrap();
        if let Some(back) = buckets.back_mut() {
            back.push(slot);
        }
    }
}

impl<T> Drop for TimeWheel<T> {
    fn drop(&mut self) {
        self.reactor.timer().del_timer_event(&self.event);
    }
}
