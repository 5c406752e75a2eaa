//! Microbenchmarks for the coroutine switch path.
//!
//! `resume_yield_roundtrip` prices one voluntary hop out of a coroutine
//! and back; `pool_get_arm_run_return` prices a whole checkout cycle the
//! way a per-connection handler would pay it.

use criterion::{criterion_group, criterion_main, Criterion};

use corio_runtime::coroutine;
use corio_runtime::pool::CoroutinePool;

fn bench_resume_yield(c: &mut Criterion) {
    let pool = CoroutinePool::global();
    let co = pool.get_coroutine();
    // parks forever; each resume costs exactly one swap in and one out
    co.set_callback(Box::new(|| loop {
        coroutine::yield_now();
    }));

    c.bench_function("resume_yield_roundtrip", |b| {
        b.iter(|| {
            coroutine::resume(&co);
        })
    });
    // the coroutine never finishes, so it stays checked out for the
    // remainder of the process
}

fn bench_pool_cycle(c: &mut Criterion) {
    let pool = CoroutinePool::global();

    c.bench_function("pool_get_arm_run_return", |b| {
        b.iter(|| {
            let co = pool.get_coroutine();
            co.set_callback(Box::new(|| {}));
            coroutine::resume(&co);
            pool.return_coroutine(&co);
        })
    });
}

criterion_group!(benches, bench_resume_yield, bench_pool_cycle);
criterion_main!(benches);
