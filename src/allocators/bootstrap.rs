//! Static bootstrap arena.
//!
//! `dlsym` may call `calloc` while heapwarden is still looking up the real
//! `calloc`. Requests made during that window are carved out of this static
//! region. Bootstrap chunks are never reused: releasing one is a no-op.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::util::layout::checked_align_up;
use crate::util::size::kb;

/// Total bootstrap capacity.
pub const BOOTSTRAP_CAPACITY: usize = kb(64);

/// Every chunk starts with a 16-byte prefix holding its usable size.
const CHUNK_PREFIX: usize = 16;

#[repr(C, align(16))]
struct Region(UnsafeCell<[u8; BOOTSTRAP_CAPACITY]>);

/// A lock-free bump region.
pub struct BootstrapArena {
    region: Region,
    head: AtomicUsize,
}

// SAFETY: chunks are handed out from disjoint ranges via an atomic bump.
unsafe impl Sync for BootstrapArena {}

impl BootstrapArena {
    /// Create an empty arena.
    pub const fn new() -> Self {
        Self {
            region: Region(UnsafeCell::new([0; BOOTSTRAP_CAPACITY])),
            head: AtomicUsize::new(0),
        }
    }

    fn base(&self) -> usize {
        self.region.0.get() as usize
    }

    /// Carve a zeroed chunk of `size` bytes, 16-byte aligned.
    ///
    /// The region starts zeroed and is never reused, so chunks are always
    /// zero-filled.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let needed = checked_align_up(size.checked_add(CHUNK_PREFIX)?, 16)?;
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let end = head.checked_add(needed)?;
            if end > BOOTSTRAP_CAPACITY {
                return None;
            }
            match self
                .head
                .compare_exchange_weak(head, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        let chunk = (self.base() + head) as *mut u8;
        // SAFETY: [head, head + needed) lies within the region and is ours.
        unsafe {
            chunk.cast::<usize>().write(size);
            NonNull::new(chunk.add(CHUNK_PREFIX))
        }
    }

    /// Check whether `ptr` points into this arena.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        addr >= self.base() && addr < self.base() + BOOTSTRAP_CAPACITY
    }

    /// The usable size recorded for a chunk.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`alloc`](Self::alloc) on this arena.
    pub unsafe fn chunk_size(&self, ptr: NonNull<u8>) -> usize {
        ptr.as_ptr().sub(CHUNK_PREFIX).cast::<usize>().read()
    }

    /// Bytes handed out so far, prefixes included.
    pub fn used(&self) -> usize {
        self.head.load(Ordering::Relaxed)
    }
}

impl Default for BootstrapArena {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide bootstrap arena.
pub static BOOTSTRAP: BootstrapArena = BootstrapArena::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_are_aligned_and_sized() {
        let arena = BootstrapArena::new();
        let a = arena.alloc(10).unwrap();
        let b = arena.alloc(33).unwrap();

        assert_eq!(a.as_ptr() as usize % 16, 0);
        assert_eq!(b.as_ptr() as usize % 16, 0);
        assert!(arena.contains(a.as_ptr()));
        assert!(arena.contains(b.as_ptr()));
        unsafe {
            assert_eq!(arena.chunk_size(a), 10);
            assert_eq!(arena.chunk_size(b), 33);
        }
        assert_eq!(arena.used(), 32 + 64);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let arena = BootstrapArena::new();
        assert!(arena.alloc(BOOTSTRAP_CAPACITY).is_none());
        assert!(arena.alloc(BOOTSTRAP_CAPACITY - CHUNK_PREFIX).is_some());
        assert!(arena.alloc(1).is_none());
    }

    #[test]
    fn test_foreign_pointer_not_contained() {
        let arena = BootstrapArena::new();
        let local = 0u64;
        assert!(!arena.contains(std::ptr::addr_of!(local).cast()));
    }
}
