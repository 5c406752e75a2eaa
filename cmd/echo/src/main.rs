//! TCP echo over the corio runtime.
//!
//! Server mode runs an accept coroutine on the main thread's reactor and
//! fans connections out over an `IoThreadPool`. Every connection sits on
//! a time wheel; one full rotation without traffic shuts it down.
//!
//! Client mode opens k connections on one loop and plays m round trips
//! on each, all interleaved through the hooked sockets.
//!
//! Usage:
//!     corio-echo --server [port] [io-threads]
//!     corio-echo --client [port] [connections] [rounds]
//!
//! Environment:
//!     CORIO_LOG_LEVEL=debug      leveled stderr logging
//!     CORIO_WHEEL_INTERVAL_S=2   quicker idle eviction for demos

use corio::{
    cdebug, cerror, cinfo, init, resume, set_thread_tag, CoTcpListener, CoTcpStream, Coroutine,
    CoroutinePool, IoThreadPool, Reactor, ReactorKind, RtResult, RuntimeConfig, Slot, TimeWheel,
};

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

const ECHO_BUF: usize = 4096;
const DEFAULT_PORT: u16 = 9527;

fn main() {
    if let Err(e) = init(RuntimeConfig::from_env()) {
        eprintln!("config rejected: {}", e);
        std::process::exit(2);
    }
    set_thread_tag("main");

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    match args.get(1).map(String::as_str) {
        Some("--server") => {
            let workers = args
                .get(3)
                .and_then(|s| s.parse().ok())
                .unwrap_or(corio::config().io_threads);
            run_server(port, workers);
        }
        Some("--client") => {
            let conns = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(8);
            let rounds = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(100);
            run_client(port, conns, rounds);
        }
        _ => {
            eprintln!("usage: corio-echo --server [port] [io-threads]");
            eprintln!("       corio-echo --client [port] [connections] [rounds]");
            std::process::exit(2);
        }
    }
}

/// What the wheel needs to remember about a connection to evict it.
struct ConnMark {
    fd: RawFd,
}

fn run_server(port: u16, workers: usize) {
    let reactor = Reactor::current();
    reactor.set_kind(ReactorKind::Main);

    let mut pool = IoThreadPool::new(workers);
    pool.start();
    let pool = Arc::new(pool);

    let cfg = corio::config();
    let wheel = Arc::new(TimeWheel::<ConnMark>::new(
        &reactor,
        cfg.wheel_buckets,
        cfg.wheel_interval_s,
    ));

    let listener = match CoTcpListener::bind(port) {
        Ok(l) => l,
        Err(e) => {
            cerror!("bind failed: {}", e);
            std::process::exit(1);
        }
    };
    cinfo!(
        "echo server on 0.0.0.0:{} with {} io threads, idle cutoff {}s",
        port,
        workers,
        cfg.wheel_buckets as u64 * cfg.wheel_interval_s
    );

    let accept_co = CoroutinePool::global().get_coroutine();
    {
        let pool = pool.clone();
        let wheel = wheel.clone();
        accept_co.set_callback(Box::new(move || loop {
            match listener.accept() {
                Ok(stream) => dispatch(&pool, &wheel, stream),
                Err(e) => cerror!("accept failed: {}", e),
            }
        }));
    }
    resume(&accept_co);

    reactor.loop_run();
}

/// Hand a fresh connection to one of the sub loops.
fn dispatch(pool: &Arc<IoThreadPool>, wheel: &Arc<TimeWheel<ConnMark>>, stream: CoTcpStream) {
    let peer = stream.peer_addr();
    let target = pool.get().reactor().clone();
    let wheel = wheel.clone();

    let co = CoroutinePool::global().get_coroutine();
    co.set_callback(Box::new(move || {
        if let Err(e) = serve(&stream, &wheel) {
            cdebug!("connection fd {} ended: {}", stream.fd(), e);
        }
        // recycle once the body has fully switched out; the task runs on
        // this coroutine's own loop a tick later
        let me = Coroutine::current();
        Reactor::current().add_task(move || {
            CoroutinePool::global().return_coroutine(&me);
        });
    }));

    cdebug!("connection from {:?} handed to a sub loop", peer);
    target.add_coroutine(co);
}

fn serve(stream: &CoTcpStream, wheel: &Arc<TimeWheel<ConnMark>>) -> RtResult<()> {
    let conn = Arc::new(ConnMark { fd: stream.fd() });
    let mut slot: Weak<Slot<ConnMark>> = Weak::new();
    let mut buf = [0u8; ECHO_BUF];

    loop {
        // push the idle cutoff out by another wheel rotation
        match slot.upgrade() {
            Some(s) => wheel.fresh(s),
            None => {
                let s = Slot::new(&conn, |c: Arc<ConnMark>| {
                    cdebug!("idle connection fd {} shut down", c.fd);
                    unsafe {
                        libc::shutdown(c.fd, libc::SHUT_RDWR);
                    }
                });
                slot = Arc::downgrade(&s);
                wheel.fresh(s);
            }
        }

        let n = stream.read(&mut buf)?;
        if n == 0 {
            cdebug!("peer closed fd {}", stream.fd());
            return Ok(());
        }
        stream.write_all(&buf[..n])?;
    }
}

fn run_client(port: u16, conns: usize, rounds: usize) {
    let reactor = Reactor::current();
    let done = Arc::new(AtomicUsize::new(0));
    let echoes = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let mut handles = Vec::with_capacity(conns);
    for i in 0..conns {
        let done = done.clone();
        let echoes = echoes.clone();
        handles.push(corio::spawn(move || {
            match client_session(port, i, rounds) {
                Ok(n) => {
                    echoes.fetch_add(n, Ordering::Relaxed);
                }
                Err(e) => cerror!("client {} failed: {}", i, e),
            }
            if done.fetch_add(1, Ordering::Relaxed) + 1 == conns {
                Reactor::current().stop();
            }
        }));
    }

    reactor.loop_run();

    let elapsed = started.elapsed();
    let total = echoes.load(Ordering::Relaxed);
    println!(
        "{} connections x {} rounds: {} echoes in {:.2?} ({:.0}/s)",
        conns,
        rounds,
        total,
        elapsed,
        total as f64 / elapsed.as_secs_f64()
    );

    for co in &handles {
        CoroutinePool::global().return_coroutine(co);
    }
}

fn client_session(port: u16, id: usize, rounds: usize) -> RtResult<usize> {
    let stream = CoTcpStream::connect("127.0.0.1", port)?;
    let mut buf = [0u8; ECHO_BUF];
    let mut completed = 0;

    for r in 0..rounds {
        let msg = format!("conn {} round {}", id, r);
        stream.write_all(msg.as_bytes())?;

        let mut got = 0;
        while got < msg.len() {
            let n = stream.read(&mut buf[got..])?;
            if n == 0 {
                cerror!("client {} cut off mid round {}", id, r);
                return Ok(completed);
            }
            got += n;
        }
        if &buf[..got] == msg.as_bytes() {
            completed += 1;
        } else {
            cerror!("client {} round {} echoed wrong payload", id, r);
        }
    }
    Ok(completed)
}
