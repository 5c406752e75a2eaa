//! Monotonic millisecond clock
//!
//! Timer deadlines are plain `i64` milliseconds on a process-local
//! monotonic scale (anchored at first use). All deadline math in the
//! runtime is relative, so the anchor never shows through.

use std::sync::OnceLock;
use std::time::Instant;

static ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Milliseconds since the process-local anchor. Monotonic, never negative.
#[inline]
pub fn now_ms() -> i64 {
    let anchor = ANCHOR.get_or_init(Instant::now);
    anchor.elapsed().as_millis() as i64
}
