//! # Coroutine pool
//!
//! Pre-creates `pool_size` coroutines on one stack arena and recycles
//! them. When every primary slot is taken (or still running its body),
//! acquisition falls through to overflow arenas, growing one arena at a
//! time. Acquisition never blocks.
//!
//! A slot is reusable only when it is both returned *and* no longer
//! inside its body: a connection can hand back a coroutine that is still
//! suspended mid-body (idle eviction does this), and handing that stack
//! to someone else would be a use-after-return.

use crate::config;
use crate::coroutine::Coroutine;
use crate::stack::StackArena;

use corio_core::cerror;

use std::sync::{Arc, Mutex, OnceLock};

pub struct CoroutinePool {
    pool_size: usize,
    stack_size: usize,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    /// (coroutine, taken) pairs; index == Coroutine::pool_index
    primary: Vec<(Arc<Coroutine>, bool)>,
    /// arenas[0] backs the primary slots; the rest are overflow
    arenas: Vec<Arc<StackArena>>,
}

static POOL: OnceLock<CoroutinePool> = OnceLock::new();

impl CoroutinePool {
    /// Process-wide pool, built from [`config::get`] on first use.
    pub fn global() -> &'static CoroutinePool {
        POOL.get_or_init(|| {
            let cfg = config::get();
            CoroutinePool::new(cfg.pool_size, cfg.stack_size)
        })
    }

    /// Build a pool with `pool_size` ready coroutines of `stack_size`
    /// bytes each. Aborts if the backing arena cannot be mapped; nothing
    /// works without stacks.
    pub fn new(pool_size: usize, stack_size: usize) -> CoroutinePool {
        // The creating thread gets its main coroutine set up here, before
        // any resume can happen.
        let _ = Coroutine::main();

        let arena = match StackArena::new(stack_size, pool_size) {
            Ok(a) => Arc::new(a),
            Err(e) => {
                cerror!("coroutine pool: primary arena failed: {}", e);
                std::process::abort();
            }
        };
        let mut primary = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            // A fresh arena always has blocks for its own slot count.
            if let Some(block) = arena.get_block() {
                if let Some(co) = Coroutine::new(block, stack_size) {
                    co.set_pool_index(i as i32);
                    primary.push((co, false));
                }
            }
        }
        CoroutinePool {
            pool_size,
            stack_size,
            inner: Mutex::new(PoolInner {
                primary,
                arenas: vec![arena],
            }),
        }
    }

    #[inline]
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Hand out a coroutine: first free-and-idle primary slot, else a
    /// block from an overflow arena, else a brand-new overflow arena.
    pub fn get_coroutine(&self) -> Arc<Coroutine> {
        let mut inner = self.inner.lock().unwrap();
        for (co, taken) in inner.primary.iter_mut() {
            if !*taken && !co.is_in_body() {
                *taken = true;
                return co.clone();
            }
        }

        for arena in inner.arenas.iter().skip(1) {
            if let Some(block) = arena.get_block() {
                if let Some(co) = Coroutine::new(block, self.stack_size) {
                    return co;
                }
            }
        }

        let arena = match StackArena::new(self.stack_size, self.pool_size) {
            Ok(a) => Arc::new(a),
            Err(e) => {
                cerror!("coroutine pool: overflow arena failed: {}", e);
                std::process::abort();
            }
        };
        inner.arenas.push(arena.clone());
        // Still under the pool lock, so the fresh arena's first block is ours.
        match arena.get_block().and_then(|b| Coroutine::new(b, self.stack_size)) {
            Some(co) => co,
            None => {
                cerror!("coroutine pool: fresh overflow arena handed out no block");
                std::process::abort();
            }
        }
    }

    /// Give a coroutine back. Primary slots are freed by index; overflow
    /// coroutines return their stack block to the owning arena.
    pub fn return_coroutine(&self, co: &Arc<Coroutine>) {
        let idx = co.pool_index();
        let mut inner = self.inner.lock().unwrap();
        if idx >= 0 && (idx as usize) < self.pool_size {
            let slot = &mut inner.primary[idx as usize];
            if !slot.1 {
                cerror!("coroutine {} returned twice", co.id());
                return;
            }
            slot.1 = false;
            return;
        }
        for arena in inner.arenas.iter().skip(1) {
            if arena.has_block(co.stack_ptr()) {
                arena.back_block(co.stack_ptr());
                return;
            }
        }
        cerror!("coroutine {} does not belong to the pool", co.id());
    }
}
