//! Concurrent sleep demo.
//!
//! N coroutines sleep for the same interval on a single thread. Total
//! wall time stays near one interval because each `sleep` parks only
//! its coroutine, not the loop.
//!
//! Usage:
//!     corio-sleep [sleepers] [seconds]

use corio::{init, sleep, CoroutinePool, Reactor, RuntimeConfig};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

fn main() {
    if let Err(e) = init(RuntimeConfig::from_env()) {
        eprintln!("config rejected: {}", e);
        std::process::exit(2);
    }

    let args: Vec<String> = std::env::args().collect();
    let sleepers: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(5);
    let seconds: u32 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(1);

    println!("{} coroutines sleeping {}s each on one thread", sleepers, seconds);

    let done = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let mut handles = Vec::with_capacity(sleepers);
    for i in 0..sleepers {
        let done = done.clone();
        handles.push(corio::spawn(move || {
            let begun = Instant::now();
            sleep(seconds);
            println!("sleeper {} woke after {:.2?}", i, begun.elapsed());
            if done.fetch_add(1, Ordering::Relaxed) + 1 == sleepers {
                Reactor::current().stop();
            }
        }));
    }

    Reactor::current().loop_run();

    println!("total wall time {:.2?}", started.elapsed());

    for co in &handles {
        CoroutinePool::global().return_coroutine(co);
    }
}
