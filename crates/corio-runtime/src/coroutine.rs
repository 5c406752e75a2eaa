//! # Stackful coroutines
//!
//! Each thread owns a lazily created *main* coroutine (id 0, no stack of
//! its own) and at most one *current* coroutine. Control always bounces
//! through main:
//!
//! ```text
//!   main coroutine                 pooled coroutine
//!   ──────────────                 ────────────────
//!   resume(co) ───swap_context───► entry / body
//!        ▲                             │
//!        └────────swap_context─── yield_now()
//! ```
//!
//! `resume` is only legal from main, `yield_now` only from a non-main
//! coroutine; breaking either rule is a logged no-op. A coroutine whose
//! body returned flips `resumable` off and yields one last time; the pool
//! re-arms it with [`Coroutine::set_callback`], which rebuilds the switch
//! context from scratch.

use crate::arch::current::{init_context, swap_context};
use crate::arch::SwitchContext;

use corio_core::cerror;
use corio_core::id::CoroutineId;
use corio_core::klog;
use corio_core::runctx::RunContext;

use std::cell::{Cell, OnceCell, UnsafeCell};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

thread_local! {
    static MAIN_CO: OnceCell<Arc<Coroutine>> = const { OnceCell::new() };
    static CURRENT_CO: Cell<Option<Arc<Coroutine>>> = const { Cell::new(None) };
}

/// A cooperatively scheduled stackful coroutine.
///
/// Shared as `Arc<Coroutine>`; the pool, fd channels and timer closures
/// all hold references to the same object while it is suspended.
pub struct Coroutine {
    id: CoroutineId,
    ctx: UnsafeCell<SwitchContext>,
    stack_ptr: *mut u8,
    stack_size: usize,
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    in_body: AtomicBool,
    resumable: AtomicBool,
    /// Slot in the pool's primary vector, -1 for overflow/main coroutines
    pool_index: AtomicI32,
    run_ctx: Mutex<RunContext>,
}

// Safety: the switch context and stack are only ever touched by the one
// thread that is resuming or running this coroutine; migration between
// threads happens only while it sits suspended at a yield point. Flags
// are atomics, the rest sits behind mutexes.
unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

impl Coroutine {
    /// Pooled-coroutine constructor. Returns `None` (logged) for a null
    /// stack; the arena hands out real blocks only.
    pub fn new(stack_ptr: *mut u8, stack_size: usize) -> Option<Arc<Coroutine>> {
        if stack_ptr.is_null() {
            cerror!("refusing to create a coroutine on a null stack");
            return None;
        }
        // Make sure this thread has its main coroutine before the first
        // resume ever happens.
        let _ = Coroutine::main();
        Some(Arc::new(Coroutine {
            id: CoroutineId::alloc(),
            ctx: UnsafeCell::new(SwitchContext::zeroed()),
            stack_ptr,
            stack_size,
            callback: Mutex::new(None),
            in_body: AtomicBool::new(false),
            resumable: AtomicBool::new(false),
            pool_index: AtomicI32::new(-1),
            run_ctx: Mutex::new(RunContext::new()),
        }))
    }

    fn new_main() -> Arc<Coroutine> {
        Arc::new(Coroutine {
            id: CoroutineId::MAIN,
            ctx: UnsafeCell::new(SwitchContext::zeroed()),
            stack_ptr: std::ptr::null_mut(),
            stack_size: 0,
            callback: Mutex::new(None),
            in_body: AtomicBool::new(false),
            resumable: AtomicBool::new(false),
            pool_index: AtomicI32::new(-1),
            run_ctx: Mutex::new(RunContext::new()),
        })
    }

    /// This thread's main coroutine, created on first use.
    pub fn main() -> Arc<Coroutine> {
        MAIN_CO.with(|m| {
            let main = m.get_or_init(Coroutine::new_main).clone();
            CURRENT_CO.with(|c| {
                let cur = c.take();
                match cur {
                    Some(existing) => c.set(Some(existing)),
                    None => c.set(Some(main.clone())),
                }
            });
            main
        })
    }

    /// The coroutine currently running on this thread.
    pub fn current() -> Arc<Coroutine> {
        let cur = CURRENT_CO.with(|c| {
            let v = c.take();
            if let Some(ref a) = v {
                let clone = a.clone();
                c.set(v);
                return Some(clone);
            }
            None
        });
        match cur {
            Some(co) => co,
            None => Coroutine::main(),
        }
    }

    /// Arm (or re-arm) this coroutine with a body. Rebuilds the switch
    /// context so the next resume starts at the entry trampoline.
    ///
    /// Rejected (logged, returns false) for the main coroutine and for a
    /// coroutine whose previous body has not finished yet.
    pub fn set_callback(&self, cb: Box<dyn FnOnce() + Send>) -> bool {
        if self.id.is_main() {
            cerror!("cannot set a callback on the main coroutine");
            return false;
        }
        if self.in_body.load(Ordering::Acquire) {
            cerror!("coroutine {} is still inside its body", self.id);
            return false;
        }
        *self.callback.lock().unwrap() = Some(cb);
        self.run_ctx.lock().unwrap().clear();
        let top = unsafe { self.stack_ptr.add(self.stack_size) };
        unsafe {
            init_context(
                self.ctx.get(),
                top,
                coroutine_entry as usize,
                self as *const Coroutine as usize,
            );
        }
        self.resumable.store(true, Ordering::Release);
        true
    }

    #[inline]
    pub fn id(&self) -> CoroutineId {
        self.id
    }

    #[inline]
    pub fn is_in_body(&self) -> bool {
        self.in_body.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_resumable(&self) -> bool {
        self.resumable.load(Ordering::Acquire)
    }

    #[inline]
    pub fn stack_ptr(&self) -> *mut u8 {
        self.stack_ptr
    }

    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    #[inline]
    pub(crate) fn pool_index(&self) -> i32 {
        self.pool_index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_pool_index(&self, idx: i32) {
        self.pool_index.store(idx, Ordering::Relaxed);
    }

    /// Request-scoped context of this coroutine (msg id, method name).
    pub fn run_ctx(&self) -> MutexGuard<'_, RunContext> {
        self.run_ctx.lock().unwrap()
    }
}

/// True when the calling thread is executing its main coroutine (or has
/// not touched coroutines at all yet).
pub fn is_main_coroutine() -> bool {
    CURRENT_CO.with(|c| {
        let v = c.take();
        let is_main = match v {
            Some(ref co) => co.id().is_main(),
            None => true,
        };
        c.set(v);
        is_main
    })
}

/// Switch from the main coroutine into `co`.
///
/// Logged no-ops: calling from a non-main coroutine, or resuming a
/// coroutine that is not armed (`resumable` off).
pub fn resume(co: &Arc<Coroutine>) {
    if !is_main_coroutine() {
        cerror!("resume must be called from the main coroutine");
        return;
    }
    if !co.is_resumable() {
        cerror!("coroutine {} is not resumable", co.id());
        return;
    }
    let main = Coroutine::main();
    CURRENT_CO.with(|c| c.set(Some(co.clone())));
    klog::set_context_id(co.id().as_u32());
    unsafe {
        swap_context(main.ctx.get(), co.ctx.get());
    }
}

/// Suspend the current coroutine and return control to this thread's
/// main coroutine. Logged no-op when already in main.
pub fn yield_now() {
    let cur = Coroutine::current();
    if cur.id().is_main() {
        cerror!("cannot yield the main coroutine");
        return;
    }
    let main = Coroutine::main();
    let cur_ctx = cur.ctx.get();
    let main_ctx = main.ctx.get();
    CURRENT_CO.with(|c| c.set(Some(main.clone())));
    klog::clear_context_id();
    // Drop the Arcs before switching away: a completing coroutine never
    // comes back to run destructors on this frame. The pool (or the
    // resumer's frame) keeps the object alive across the swap.
    drop(cur);
    drop(main);
    unsafe {
        swap_context(cur_ctx, main_ctx);
    }
}

/// Body wrapper every armed coroutine starts in: runs the callback, marks
/// the coroutine finished and yields for the last time.
unsafe extern "C" fn coroutine_entry(co_ptr: usize) {
    let co = &*(co_ptr as *const Coroutine);
    co.in_body.store(true, Ordering::Release);
    let cb = co.callback.lock().unwrap().take();
    if let Some(cb) = cb {
        cb();
    }
    co.in_body.store(false, Ordering::Release);
    co.resumable.store(false, Ordering::Release);
    yield_now();
    // Unreachable in a correct program; the trampoline aborts if the
    // final yield ever falls through.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackArena;
    use std::sync::atomic::AtomicUsize;

    const TEST_STACK: usize = 64 * 1024;

    fn pooled(arena: &StackArena) -> Arc<Coroutine> {
        Coroutine::new(arena.get_block().unwrap(), arena.block_size()).unwrap()
    }

    #[test]
    fn test_resume_yield_round_trips() {
        let arena = StackArena::new(TEST_STACK, 1).unwrap();
        let co = pooled(&arena);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        assert!(co.set_callback(Box::new(move || {
            for _ in 0..5 {
                h.fetch_add(1, Ordering::SeqCst);
                yield_now();
            }
        })));

        for expect in 1..=5 {
            resume(&co);
            assert_eq!(hits.load(Ordering::SeqCst), expect);
        }
        assert!(co.is_resumable(), "suspended at its last yield");
        resume(&co); // body returns here
        assert!(!co.is_resumable());
        assert!(!co.is_in_body());
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_callee_saved_state_survives_yields() {
        let arena = StackArena::new(TEST_STACK, 1).unwrap();
        let co = pooled(&arena);
        let out = Arc::new(AtomicUsize::new(0));
        let o = out.clone();
        co.set_callback(Box::new(move || {
            let mut acc: usize = 1;
            for i in 2..=6usize {
                acc = acc.wrapping_mul(i);
                yield_now();
            }
            o.store(acc, Ordering::SeqCst);
        }));
        while co.is_resumable() {
            resume(&co);
        }
        assert_eq!(out.load(Ordering::SeqCst), 720); // 6!
    }

    #[test]
    fn test_current_identity_inside_body() {
        let arena = StackArena::new(TEST_STACK, 1).unwrap();
        let co = pooled(&arena);
        let id = co.id();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        co.set_callback(Box::new(move || {
            assert!(!is_main_coroutine());
            assert_eq!(Coroutine::current().id(), id);
            s.store(1, Ordering::SeqCst);
        }));
        assert!(is_main_coroutine());
        resume(&co);
        assert!(is_main_coroutine());
        assert_eq!(Coroutine::current().id(), CoroutineId::MAIN);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_misuse_is_noop() {
        corio_core::set_log_level(corio_core::LogLevel::Off);
        // yield from main: nothing happens
        yield_now();
        assert!(is_main_coroutine());

        // resume of an unarmed coroutine: nothing happens
        let arena = StackArena::new(TEST_STACK, 1).unwrap();
        let co = pooled(&arena);
        resume(&co);
        assert!(!co.is_in_body());

        // main coroutine cannot take a callback
        let main = Coroutine::main();
        assert!(!main.set_callback(Box::new(|| {})));
    }

    #[test]
    fn test_set_callback_rejected_while_in_body() {
        corio_core::set_log_level(corio_core::LogLevel::Off);
        let arena = StackArena::new(TEST_STACK, 1).unwrap();
        let co = pooled(&arena);
        let co2 = co.clone();
        let rejected = Arc::new(AtomicUsize::new(0));
        let r = rejected.clone();
        co.set_callback(Box::new(move || {
            if !co2.set_callback(Box::new(|| {})) {
                r.store(1, Ordering::SeqCst);
            }
        }));
        resume(&co);
        assert_eq!(rejected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rearm_reuses_the_same_object() {
        let arena = StackArena::new(TEST_STACK, 1).unwrap();
        let co = pooled(&arena);
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let r = runs.clone();
            assert!(co.set_callback(Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            })));
            resume(&co);
            assert!(!co.is_resumable());
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_run_ctx_cleared_on_rearm() {
        let arena = StackArena::new(TEST_STACK, 1).unwrap();
        let co = pooled(&arena);
        co.run_ctx().msg_id = "123".into();
        co.set_callback(Box::new(|| {}));
        assert!(co.run_ctx().is_empty());
        resume(&co);
    }
}
