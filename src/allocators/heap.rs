//! The raw allocator seam.

use std::ptr::NonNull;

use crate::api::error::HeapError;

/// The real allocate/resize/release primitives a tracker wraps.
///
/// Implementations return `None` on failure; they never panic and never
/// call back into a tracker.
///
/// # Safety
///
/// Memory returned by `raw_allocate`, `raw_zero_allocate` and `raw_resize`
/// must be aligned to at least 16 bytes and valid for the requested size
/// until passed to `raw_release` or `raw_resize`.
pub unsafe trait RawHeap: Send + Sync {
    /// Make sure the primitives are usable.
    ///
    /// Called before any lock is taken, so an implementation that needs to
    /// resolve symbols may re-enter the allocator while doing so.
    fn ensure_ready(&self) -> Result<(), HeapError> {
        Ok(())
    }

    /// Allocate `size` uninitialized bytes.
    fn raw_allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// Allocate `size` zeroed bytes.
    fn raw_zero_allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.raw_allocate(size)?;
        // SAFETY: freshly allocated for `size` bytes.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Some(ptr)
    }

    /// Resize an allocation, preserving the lesser of the old and new sizes.
    ///
    /// On failure the original allocation is untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this heap and not have been released.
    unsafe fn raw_resize(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>>;

    /// Return an allocation to the heap.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this heap and not have been released.
    unsafe fn raw_release(&self, ptr: NonNull<u8>);
}

/// The C library allocator, called through its linked symbols.
///
/// Only correct when the process's `malloc` symbols are *not* bound to
/// heapwarden itself, as in tests, benchmarks and embedding harnesses. The
/// preloaded library uses [`NextHeap`](super::NextHeap).
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcHeap;

unsafe impl RawHeap for LibcHeap {
    fn raw_allocate(&self, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: malloc accepts any size.
        NonNull::new(unsafe { libc::malloc(size) }.cast())
    }

    fn raw_zero_allocate(&self, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: calloc accepts any size.
        NonNull::new(unsafe { libc::calloc(1, size) }.cast())
    }

    unsafe fn raw_resize(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        NonNull::new(libc::realloc(ptr.as_ptr().cast(), size).cast())
    }

    unsafe fn raw_release(&self, ptr: NonNull<u8>) {
        libc::free(ptr.as_ptr().cast());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_libc_heap_roundtrip() {
        let heap = LibcHeap;
        let ptr = heap.raw_allocate(64).expect("malloc");
        assert_eq!(ptr.as_ptr() as usize % 16, 0);

        unsafe {
            ptr.as_ptr().write_bytes(0x5A, 64);
            let grown = heap.raw_resize(ptr, 256).expect("realloc");
            assert_eq!(*grown.as_ptr().add(63), 0x5A);
            heap.raw_release(grown);
        }
    }

    #[test]
    fn test_zero_allocate_is_zeroed() {
        let heap = LibcHeap;
        let ptr = heap.raw_zero_allocate(128).expect("calloc");
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 128) };
        assert!(bytes.iter().all(|b| *b == 0));
        unsafe { heap.raw_release(ptr) };
    }
}
