//! Exported C allocator symbols.
//!
//! Compiled with the `interpose` feature. Preloading the resulting `cdylib`
//! binds every `malloc`, `calloc`, `realloc` and `free` in the process,
//! third-party libraries included, to the process tracker:
//!
//! ```text
//! cargo build --release --features interpose
//! LD_PRELOAD=target/release/libheapwarden.so ./your_app
//! ```
//!
//! Every error is fatal here; there is no null-returning failure path.

use std::ffi::{c_int, c_void};

use crate::api::error::HeapError;
use crate::process::{self, tracker};
use crate::util::layout::checked_align_up;

/// `malloc(3)`.
///
/// # Safety
///
/// Callable from C with any size.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    tracker().allocate(size).as_ptr().cast()
}

/// `calloc(3)`. An overflowing `count * size` is fatal.
///
/// # Safety
///
/// Callable from C with any arguments.
#[no_mangle]
pub unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
    tracker().zero_allocate(count, size).as_ptr().cast()
}

/// `realloc(3)`. A null `ptr` allocates; a zero `size` yields a live
/// zero-length block.
///
/// # Safety
///
/// `ptr` must be null or a pointer returned by these functions.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    tracker().resize(ptr.cast(), size).as_ptr().cast()
}

/// `free(3)`. Null is a no-op.
///
/// # Safety
///
/// `ptr` must be null or a pointer returned by these functions.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    tracker().release(ptr.cast())
}

/// `cfree(3)`, the obsolete alias of [`free`].
///
/// # Safety
///
/// Same as [`free`].
#[no_mangle]
pub unsafe extern "C" fn cfree(ptr: *mut c_void) {
    free(ptr)
}

fn valid_alignment(align: usize) -> bool {
    align.is_power_of_two() && align % std::mem::size_of::<*mut c_void>() == 0
}

/// `posix_memalign(3)`.
///
/// # Safety
///
/// `memptr` must be valid for a pointer write.
#[no_mangle]
pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut c_void, align: usize, size: usize) -> c_int {
    if !valid_alignment(align) {
        return libc::EINVAL;
    }
    *memptr = tracker().allocate_aligned(align, size).as_ptr().cast();
    0
}

/// `aligned_alloc(3)`.
///
/// # Safety
///
/// Callable from C with any arguments.
#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(align: usize, size: usize) -> *mut c_void {
    if !align.is_power_of_two() {
        *libc::__errno_location() = libc::EINVAL;
        return std::ptr::null_mut();
    }
    tracker().allocate_aligned(align, size).as_ptr().cast()
}

/// `memalign(3)`.
///
/// # Safety
///
/// Callable from C with any arguments.
#[no_mangle]
pub unsafe extern "C" fn memalign(align: usize, size: usize) -> *mut c_void {
    aligned_alloc(align, size)
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(4096) as usize
}

/// `valloc(3)`: page-aligned allocation.
///
/// # Safety
///
/// Callable from C with any size.
#[no_mangle]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    tracker().allocate_aligned(page_size(), size).as_ptr().cast()
}

/// `pvalloc(3)`: page-aligned, size rounded up to whole pages (at least one).
///
/// # Safety
///
/// Callable from C with any size.
#[no_mangle]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    let page = page_size();
    let tracker = tracker();
    let Some(rounded) = checked_align_up(size.max(1), page) else {
        tracker.fail(&HeapError::SizeOverflow { count: size, size: page })
    };
    tracker.allocate_aligned(page, rounded).as_ptr().cast()
}

/// `malloc_usable_size(3)`: the size that was requested.
///
/// # Safety
///
/// `ptr` must be null or a live pointer returned by these functions.
#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    tracker().usable_size(ptr.cast())
}

extern "C" fn load_constructor() {
    process::install();
}

#[used]
#[link_section = ".init_array"]
static INIT: extern "C" fn() = load_constructor;
