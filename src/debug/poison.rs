//! Memory poisoning.
//!
//! Fresh user regions are filled with [`FRESH_PATTERN`] so reads of
//! uninitialized memory stand out; released regions get [`RELEASED_PATTERN`]
//! so use-after-release reads garbage that is easy to recognize.

/// Pattern written over released user memory.
pub const RELEASED_PATTERN: u8 = 0xCD;

/// Pattern written over freshly allocated (not zeroed) user memory.
pub const FRESH_PATTERN: u8 = 0xAB;

/// Poison a region with the released pattern.
///
/// # Safety
///
/// The memory region must be valid and writable.
pub unsafe fn poison_released(ptr: *mut u8, size: usize) {
    std::ptr::write_bytes(ptr, RELEASED_PATTERN, size);
}

/// Poison a region with the fresh pattern.
///
/// # Safety
///
/// The memory region must be valid and writable.
pub unsafe fn poison_fresh(ptr: *mut u8, size: usize) {
    std::ptr::write_bytes(ptr, FRESH_PATTERN, size);
}

/// Check whether every byte of a region holds `pattern`.
///
/// # Safety
///
/// The memory region must be valid for reads.
pub unsafe fn is_poisoned_with(ptr: *const u8, size: usize, pattern: u8) -> bool {
    std::slice::from_raw_parts(ptr, size).iter().all(|b| *b == pattern)
}
