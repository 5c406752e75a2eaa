//! # I/O threads
//!
//! An `IoThread` owns one OS thread and the reactor that lives on it.
//! Construction performs a two-phase handshake so a pool can bring up
//! every thread before any of them starts handling events:
//!
//! ```text
//!   pool thread                       io thread "corio-io-N"
//!   -----------                       ----------------------
//!   IoThread::new() ---- spawn ----→  create reactor, mark Sub,
//!        |                            touch main coroutine
//!        |←------- ready(reactor) ----'
//!   (all threads built)
//!   start() ----------- start -----→  loop_run() until stop()
//! ```
//!
//! `IoThreadPool` fans work out over its threads; coroutines land on a
//! target reactor as resume tasks, never by direct cross-thread resume.

use crate::coroutine::Coroutine;
use crate::pool::CoroutinePool;
use crate::reactor::{Reactor, ReactorKind};

use corio_core::time::now_ms;
use corio_core::{cdebug, cerror, klog};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct IoThread {
    index: usize,
    reactor: Arc<Reactor>,
    start_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl IoThread {
    /// Spawn the thread and block until its reactor is ready. The loop
    /// does not run until [`start`](IoThread::start) releases it.
    pub fn new(index: usize, kind: ReactorKind) -> IoThread {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (start_tx, start_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name(format!("corio-io-{}", index))
            .spawn(move || {
                // One leaked tag per io thread; they live for the process.
                klog::set_thread_tag(Box::leak(format!("corio-io-{}", index).into_boxed_str()));
                let reactor = Reactor::current();
                reactor.set_kind(kind);
                Coroutine::main();
                cdebug!("io thread {} ready on tid {}", index, reactor.tid());
                if ready_tx.send(reactor.clone()).is_err() {
                    return;
                }
                if start_rx.recv().is_err() {
                    // owner dropped us before start
                    cdebug!("io thread {} released without starting", index);
                    return;
                }
                cdebug!("io thread {} enters its loop", index);
                reactor.loop_run();
            })
            .expect("Failed to spawn io thread");

        let reactor = ready_rx
            .recv()
            .expect("Io thread died before reporting ready");

        IoThread {
            index,
            reactor,
            start_tx: Some(start_tx),
            handle: Some(handle),
        }
    }

    /// Release the thread into its event loop. Idempotent.
    pub fn start(&mut self) {
        if let Some(tx) = self.start_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        // a never-started thread exits when the start channel closes
        self.start_tx.take();
        if let Some(handle) = self.handle.take() {
            // stop() only lands once the loop has been entered, so keep
            // nudging until the thread is gone
            while !handle.is_finished() {
                self.reactor.stop();
                thread::sleep(Duration::from_millis(1));
            }
            if handle.join().is_err() {
                cerror!("io thread {} panicked", self.index);
            }
        }
    }
}

pub struct IoThreadPool {
    threads: Vec<IoThread>,
    next: AtomicUsize,
}

impl IoThreadPool {
    /// Build `size` Sub-loop threads. All of them are parked at the start
    /// gate until [`start`](IoThreadPool::start).
    pub fn new(size: usize) -> IoThreadPool {
        let threads = (0..size)
            .map(|i| IoThread::new(i, ReactorKind::Sub))
            .collect();
        IoThreadPool {
            threads,
            next: AtomicUsize::new(0),
        }
    }

    pub fn start(&mut self) {
        for t in &mut self.threads {
            t.start();
        }
    }

    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Round-robin over the pool.
    pub fn get(&self) -> &IoThread {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        &self.threads[i]
    }

    pub fn thread(&self, index: usize) -> Option<&IoThread> {
        self.threads.get(index)
    }

    /// Queue `co` for resume on an arbitrary pool thread. With
    /// `allow_self` off the calling thread's own loop is skipped.
    pub fn add_coroutine_to_random_thread(&self, co: Arc<Coroutine>, allow_self: bool) {
        let size = self.threads.len();
        if size == 1 {
            self.threads[0].reactor().add_coroutine(co);
            return;
        }
        let mut i = now_ms() as usize % size;
        if !allow_self && self.threads[i].reactor().is_in_loop_thread() {
            i = (i + 1) % size;
        }
        self.threads[i].reactor().add_coroutine(co);
    }

    /// Arm a pooled coroutine with `cb` and queue it on a random thread.
    ///
    /// The coroutine stays checked out of the pool until the caller hands
    /// it back with `return_coroutine`.
    pub fn spawn_on_random_thread<F>(&self, cb: F, allow_self: bool) -> Arc<Coroutine>
    where
        F: FnOnce() + Send + 'static,
    {
        let co = CoroutinePool::global().get_coroutine();
        co.set_callback(Box::new(cb));
        self.add_coroutine_to_random_thread(co.clone(), allow_self);
        co
    }

    /// Same as [`spawn_on_random_thread`](IoThreadPool::spawn_on_random_thread)
    /// but pinned to the thread at `index`. Out-of-range indexes are a
    /// logged error.
    pub fn spawn_on_thread<F>(&self, index: usize, cb: F) -> Option<Arc<Coroutine>>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(target) = self.threads.get(index) else {
            cerror!("invalid io thread index {}", index);
            return None;
        };
        let co = CoroutinePool::global().get_coroutine();
        co.set_callback(Box::new(cb));
        target.reactor().add_coroutine(co.clone());
        Some(co)
    }

    /// Run one copy of `cb` as a coroutine on every pool thread.
    pub fn spawn_on_each_thread<F>(&self, cb: F) -> Vec<Arc<Coroutine>>
    where
        F: Fn() + Send + Clone + 'static,
    {
        self.threads
            .iter()
            .map(|t| {
                let co = CoroutinePool::global().get_coroutine();
                co.set_callback(Box::new(cb.clone()));
                t.reactor().add_coroutine(co.clone());
                co
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::CoTcpListener;
    use std::io::{Read, Write};
    use std::time::Duration;

    #[test]
    fn test_round_robin_wraps() {
        let mut pool = IoThreadPool::new(2);
        pool.start();
        let picks = (pool.get().index(), pool.get().index(), pool.get().index());
        assert_eq!(picks, (0, 1, 0));
    }

    #[test]
    fn test_unstarted_pool_drops_cleanly() {
        let pool = IoThreadPool::new(2);
        drop(pool);
    }

    #[test]
    fn test_spawn_on_thread_runs_there() {
        let mut pool = IoThreadPool::new(2);
        pool.start();

        let (tx, rx) = mpsc::channel();
        let co = pool
            .spawn_on_thread(1, move || {
                let name = thread::current().name().map(String::from);
                tx.send((unsafe { libc::gettid() }, name)).unwrap();
            })
            .unwrap();

        let (tid, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(tid, pool.thread(1).unwrap().reactor().tid());
        assert_eq!(name.as_deref(), Some("corio-io-1"));
        assert!(pool.spawn_on_thread(9, || {}).is_none());

        drop(pool);
        CoroutinePool::global().return_coroutine(&co);
    }

    #[test]
    fn test_spawn_on_each_thread_covers_pool() {
        let mut pool = IoThreadPool::new(3);
        pool.start();

        let (tx, rx) = mpsc::channel();
        let coroutines = pool.spawn_on_each_thread(move || {
            tx.send(unsafe { libc::gettid() }).unwrap();
        });

        let mut tids: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        tids.sort_unstable();
        tids.dedup();
        assert_eq!(tids.len(), 3);

        drop(pool);
        for co in &coroutines {
            CoroutinePool::global().return_coroutine(co);
        }
    }

    #[test]
    fn test_echo_served_from_the_pool() {
        let mut pool = IoThreadPool::new(2);
        pool.start();
        let pool = Arc::new(pool);

        let listener = CoTcpListener::bind(0).unwrap();
        let port = {
            let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            let mut sa_len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            let ret = unsafe {
                libc::getsockname(
                    listener.fd(),
                    &mut sa as *mut _ as *mut libc::sockaddr,
                    &mut sa_len,
                )
            };
            assert_eq!(ret, 0);
            u16::from_be(sa.sin_port)
        };

        // accept on a Main loop, serve from whichever Sub loop the pool
        // picks
        let (served_tx, served_rx) = mpsc::channel();
        let (handle_tx, handle_rx) = mpsc::channel();
        let dispatch_pool = pool.clone();
        let accept_co = CoroutinePool::global().get_coroutine();
        accept_co.set_callback(Box::new(move || {
            let stream = listener.accept().unwrap();
            let served = dispatch_pool.spawn_on_random_thread(
                move || {
                    let mut buf = [0u8; 64];
                    loop {
                        let n = stream.read(&mut buf).unwrap();
                        if n == 0 {
                            break;
                        }
                        stream.write_all(&buf[..n]).unwrap();
                    }
                    served_tx.send(unsafe { libc::gettid() }).unwrap();
                },
                true,
            );
            handle_tx.send(served).unwrap();
        }));

        let (reactor_tx, reactor_rx) = mpsc::channel();
        let loop_co = accept_co.clone();
        let accept_thread = thread::spawn(move || {
            let reactor = Reactor::current();
            reactor.set_kind(ReactorKind::Main);
            reactor_tx.send(reactor.clone()).unwrap();
            crate::coroutine::resume(&loop_co);
            reactor.loop_run();
        });
        let accept_reactor = reactor_rx.recv().unwrap();

        let mut client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(b"over the pool").unwrap();
        let mut echoed = [0u8; 13];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"over the pool");
        drop(client);

        let tid = served_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let pool_tids: Vec<_> = (0..pool.size())
            .map(|i| pool.thread(i).unwrap().reactor().tid())
            .collect();
        assert!(pool_tids.contains(&tid), "echo ran outside the pool");

        let served = handle_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // stop() is a no-op until the loop is entered
        while !accept_reactor.is_looping() {
            thread::sleep(Duration::from_millis(1));
        }
        accept_reactor.stop();
        accept_thread.join().unwrap();
        CoroutinePool::global().return_coroutine(&accept_co);
        CoroutinePool::global().return_coroutine(&served);
    }

    #[test]
    fn test_random_spawn_lands_in_pool() {
        let mut pool = IoThreadPool::new(2);
        pool.start();

        let (tx, rx) = mpsc::channel();
        let co = pool.spawn_on_random_thread(
            move || {
                tx.send(unsafe { libc::gettid() }).unwrap();
            },
            false,
        );

        let tid = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let pool_tids: Vec<_> = (0..pool.size())
            .map(|i| pool.thread(i).unwrap().reactor().tid())
            .collect();
        assert!(pool_tids.contains(&tid));

        drop(pool);
        CoroutinePool::global().return_coroutine(&co);
    }
}
