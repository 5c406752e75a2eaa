//! Coroutine identifier type

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

/// Unique identifier for a coroutine.
///
/// A 32-bit value handed out by a process-wide counter. Id 0 is reserved
/// for the per-thread main coroutine; pooled coroutines start at 1.
/// The maximum value (u32::MAX) is a sentinel for "no coroutine".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CoroutineId(u32);

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

impl CoroutineId {
    /// Sentinel value indicating no coroutine
    pub const NONE: CoroutineId = CoroutineId(u32::MAX);

    /// Every thread's main coroutine carries id 0
    pub const MAIN: CoroutineId = CoroutineId(0);

    /// Create a CoroutineId from a raw value
    #[inline]
    pub const fn new(id: u32) -> Self {
        CoroutineId(id)
    }

    /// Allocate the next free id from the process-wide counter
    #[inline]
    pub fn alloc() -> Self {
        CoroutineId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw u32 value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// True for the per-thread main coroutine
    #[inline]
    pub const fn is_main(self) -> bool {
        self.0 == 0
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }

    /// Check if this is a valid coroutine id
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != u32::MAX
    }
}

impl From<u32> for CoroutineId {
    #[inline]
    fn from(id: u32) -> Self {
        CoroutineId(id)
    }
}

impl From<CoroutineId> for u32 {
    #[inline]
    fn from(id: CoroutineId) -> Self {
        id.0
    }
}

impl fmt::Debug for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "CoroutineId(NONE)")
        } else {
            write!(f, "CoroutineId({})", self.0)
        }
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for CoroutineId {
    fn default() -> Self {
        CoroutineId::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coroutine_id_basics() {
        let id = CoroutineId::new(42);
        assert_eq!(id.as_u32(), 42);
        assert!(!id.is_none());
        assert!(id.is_some());
        assert!(!id.is_main());
    }

    #[test]
    fn test_coroutine_id_none() {
        let none = CoroutineId::NONE;
        assert!(none.is_none());
        assert!(!none.is_some());
    }

    #[test]
    fn test_coroutine_id_main() {
        assert!(CoroutineId::MAIN.is_main());
        assert_eq!(CoroutineId::MAIN.as_u32(), 0);
    }

    #[test]
    fn test_coroutine_id_alloc_monotonic() {
        let a = CoroutineId::alloc();
        let b = CoroutineId::alloc();
        assert!(b.as_u32() > a.as_u32());
        assert!(!a.is_main());
    }

    #[test]
    fn test_coroutine_id_conversions() {
        let id: CoroutineId = 100u32.into();
        let raw: u32 = id.into();
        assert_eq!(raw, 100);
    }
}
