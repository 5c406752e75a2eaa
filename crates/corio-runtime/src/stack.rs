//! # Stack arena
//!
//! Fixed-size coroutine stacks carved out of one anonymous mapping:
//!
//! ```text
//! +-----------+-----------+-----------+-- ... --+-----------+
//! |  block 0  |  block 1  |  block 2  |         | block N-1 |
//! +-----------+-----------+-----------+-- ... --+-----------+
//! ^ start                                                   ^ end
//! ```
//!
//! Blocks are handed out by pointer identity: `get_block` marks the first
//! free slot used, `back_block` maps the pointer back to its slot. The
//! refcount tracks outstanding blocks so an arena is never unmapped while
//! a live stack still points into it.

use crate::last_errno;
use corio_core::error::{MemoryError, RtResult};
use corio_core::{cerror, cwarn};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub struct StackArena {
    start: *mut u8,
    size: usize,
    block_size: usize,
    block_count: usize,
    used: Mutex<Vec<bool>>,
    ref_count: AtomicUsize,
}

// The base pointer is written once in `new`; block hand-out is serialized
// by the `used` mutex and two coroutines never share a block.
unsafe impl Send for StackArena {}
unsafe impl Sync for StackArena {}

impl StackArena {
    /// Map `block_size * block_count` bytes of anonymous RW memory.
    pub fn new(block_size: usize, block_count: usize) -> RtResult<Self> {
        if block_size == 0 || block_count == 0 {
            return Err(MemoryError::ZeroSized.into());
        }
        let size = block_size * block_count;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let errno = last_errno();
            cerror!("stack arena mmap of {} bytes failed (errno {})", size, errno);
            return Err(MemoryError::MapFailed(errno).into());
        }
        Ok(StackArena {
            start: ptr as *mut u8,
            size,
            block_size,
            block_count,
            used: Mutex::new(vec![false; block_count]),
            ref_count: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Outstanding blocks (handed out, not yet returned)
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Relaxed)
    }

    /// First free block, or `None` when the arena is full.
    pub fn get_block(&self) -> Option<*mut u8> {
        let idx = {
            let mut used = self.used.lock().unwrap();
            match used.iter().position(|b| !b) {
                Some(i) => {
                    used[i] = true;
                    i
                }
                None => return None,
            }
        };
        self.ref_count.fetch_add(1, Ordering::Relaxed);
        Some(unsafe { self.start.add(idx * self.block_size) })
    }

    /// Hand a block back. Pointers outside the arena or blocks already
    /// free are logged and ignored.
    pub fn back_block(&self, ptr: *const u8) {
        if !self.has_block(ptr) {
            cerror!("back_block: pointer {:p} not from this arena", ptr);
            return;
        }
        let idx = (ptr as usize - self.start as usize) / self.block_size;
        {
            let mut used = self.used.lock().unwrap();
            if !used[idx] {
                cerror!("back_block: block {} returned twice", idx);
                return;
            }
            used[idx] = false;
        }
        self.ref_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Does `ptr` point into this arena's mapping?
    #[inline]
    pub fn has_block(&self, ptr: *const u8) -> bool {
        let p = ptr as usize;
        let start = self.start as usize;
        p >= start && p < start + self.size
    }
}

impl Drop for StackArena {
    fn drop(&mut self) {
        let live = self.ref_count.load(Ordering::Relaxed);
        if live != 0 {
            // Leak rather than unmap under a live stack.
            cwarn!("stack arena dropped with {} blocks outstanding; leaking mapping", live);
            return;
        }
        let rc = unsafe { libc::munmap(self.start as *mut libc::c_void, self.size) };
        if rc != 0 {
            cerror!("stack arena munmap failed (errno {})", last_errno());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_identity_and_spacing() {
        let arena = StackArena::new(4096, 4).unwrap();
        let a = arena.get_block().unwrap();
        let b = arena.get_block().unwrap();
        assert_ne!(a, b);
        assert_eq!((b as usize).abs_diff(a as usize) % 4096, 0);
        assert!(arena.has_block(a));
        assert!(arena.has_block(b));
        assert_eq!(arena.ref_count(), 2);

        arena.back_block(a);
        assert_eq!(arena.ref_count(), 1);
        // freed block is reissued
        let c = arena.get_block().unwrap();
        assert_eq!(c, a);
        arena.back_block(b);
        arena.back_block(c);
        assert_eq!(arena.ref_count(), 0);
    }

    #[test]
    fn test_exhaustion() {
        let arena = StackArena::new(4096, 2).unwrap();
        let a = arena.get_block().unwrap();
        let b = arena.get_block().unwrap();
        assert!(arena.get_block().is_none());
        arena.back_block(a);
        assert!(arena.get_block().is_some());
        arena.back_block(b);
    }

    #[test]
    fn test_bad_returns_are_noops() {
        corio_core::set_log_level(corio_core::LogLevel::Off);
        let arena = StackArena::new(4096, 2).unwrap();
        let a = arena.get_block().unwrap();

        // foreign pointer
        let foreign = 0x1000 as *const u8;
        assert!(!arena.has_block(foreign));
        arena.back_block(foreign);
        assert_eq!(arena.ref_count(), 1);

        // double free
        arena.back_block(a);
        arena.back_block(a);
        assert_eq!(arena.ref_count(), 0);
    }

    #[test]
    fn test_zero_sized_rejected() {
        assert!(StackArena::new(0, 4).is_err());
        assert!(StackArena::new(4096, 0).is_err());
    }

    #[test]
    fn test_blocks_are_writable() {
        let arena = StackArena::new(4096, 1).unwrap();
        let p = arena.get_block().unwrap();
        unsafe {
            std::ptr::write_bytes(p, 0xAB, 4096);
            assert_eq!(*p.add(4095), 0xAB);
        }
        arena.back_block(p);
    }
}
