//! The allocator that comes after heapwarden in symbol resolution order.
//!
//! When heapwarden is preloaded its own `malloc` shadows the C library's, so
//! the real primitives are looked up with `dlsym(RTLD_NEXT, ..)`. Lookup
//! happens at most once per process; the function pointers are write-once.

use std::ffi::{c_void, CStr};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use super::bootstrap::BOOTSTRAP;
use super::heap::RawHeap;
use crate::api::error::HeapError;

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);

const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 1;
const RESOLVED: u8 = 2;
const FAILED: u8 = 3;

/// Names of the four primitives to look up.
#[derive(Debug, Clone, Copy)]
pub struct SymbolNames {
    pub malloc: &'static CStr,
    pub calloc: &'static CStr,
    pub realloc: &'static CStr,
    pub free: &'static CStr,
}

impl SymbolNames {
    /// The standard C allocator names.
    pub const C: SymbolNames = SymbolNames {
        malloc: c"malloc",
        calloc: c"calloc",
        realloc: c"realloc",
        free: c"free",
    };
}

impl Default for SymbolNames {
    fn default() -> Self {
        Self::C
    }
}

/// Lazily resolved real allocator.
pub struct NextHeap {
    names: SymbolNames,
    state: AtomicU8,
    /// The symbol that was missing, when `state == FAILED`.
    missing: AtomicPtr<libc::c_char>,
    malloc: AtomicPtr<c_void>,
    calloc: AtomicPtr<c_void>,
    realloc: AtomicPtr<c_void>,
    free: AtomicPtr<c_void>,
}

impl NextHeap {
    /// Bind the standard C allocator names.
    pub const fn new() -> Self {
        Self::with_symbols(SymbolNames::C)
    }

    /// Bind a custom set of names.
    pub const fn with_symbols(names: SymbolNames) -> Self {
        Self {
            names,
            state: AtomicU8::new(UNRESOLVED),
            missing: AtomicPtr::new(ptr::null_mut()),
            malloc: AtomicPtr::new(ptr::null_mut()),
            calloc: AtomicPtr::new(ptr::null_mut()),
            realloc: AtomicPtr::new(ptr::null_mut()),
            free: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Whether the four primitives have been found.
    pub fn is_resolved(&self) -> bool {
        self.state.load(Ordering::Acquire) == RESOLVED
    }

    fn lookup(name: &CStr) -> *mut c_void {
        // SAFETY: name is NUL-terminated; RTLD_NEXT is a valid pseudo-handle.
        unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) }
    }

    /// Run the lookup. Only the thread that wins the UNRESOLVED -> RESOLVING
    /// transition does the work; everyone else observes the outcome.
    fn resolve(&self) -> Result<(), HeapError> {
        match self
            .state
            .compare_exchange(UNRESOLVED, RESOLVING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(RESOLVED) => return Ok(()),
            Err(FAILED) => return Err(self.failure()),
            // Someone else is mid-lookup; callers fall back to the bootstrap arena.
            Err(_) => return Ok(()),
        }

        let slots = [
            (self.names.malloc, &self.malloc),
            (self.names.calloc, &self.calloc),
            (self.names.realloc, &self.realloc),
            (self.names.free, &self.free),
        ];
        for (name, slot) in slots {
            let sym = Self::lookup(name);
            if sym.is_null() {
                self.missing.store(name.as_ptr() as *mut _, Ordering::Relaxed);
                self.state.store(FAILED, Ordering::Release);
                return Err(self.failure());
            }
            slot.store(sym, Ordering::Relaxed);
        }

        self.state.store(RESOLVED, Ordering::Release);
        Ok(())
    }

    fn failure(&self) -> HeapError {
        let missing = self.missing.load(Ordering::Relaxed);
        let symbol = if missing.is_null() {
            self.names.malloc
        } else {
            // SAFETY: `missing` always points at one of the 'static names.
            unsafe { CStr::from_ptr(missing) }
        };
        HeapError::ResolutionFailed { symbol }
    }

    fn malloc_fn(&self) -> Option<MallocFn> {
        self.resolved_fn(&self.malloc)
            // SAFETY: resolved from the `malloc` slot, which has this signature.
            .map(|f| unsafe { std::mem::transmute::<*mut c_void, MallocFn>(f) })
    }

    fn calloc_fn(&self) -> Option<CallocFn> {
        self.resolved_fn(&self.calloc)
            // SAFETY: resolved from the `calloc` slot, which has this signature.
            .map(|f| unsafe { std::mem::transmute::<*mut c_void, CallocFn>(f) })
    }

    fn realloc_fn(&self) -> Option<ReallocFn> {
        self.resolved_fn(&self.realloc)
            // SAFETY: resolved from the `realloc` slot, which has this signature.
            .map(|f| unsafe { std::mem::transmute::<*mut c_void, ReallocFn>(f) })
    }

    fn free_fn(&self) -> Option<FreeFn> {
        self.resolved_fn(&self.free)
            // SAFETY: resolved from the `free` slot, which has this signature.
            .map(|f| unsafe { std::mem::transmute::<*mut c_void, FreeFn>(f) })
    }

    fn resolved_fn(&self, slot: &AtomicPtr<c_void>) -> Option<*mut c_void> {
        if !self.is_resolved() {
            // A failed or in-flight lookup leaves the caller on the bootstrap arena.
            let _ = self.resolve();
            if !self.is_resolved() {
                return None;
            }
        }
        Some(slot.load(Ordering::Relaxed))
    }
}

impl Default for NextHeap {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawHeap for NextHeap {
    fn ensure_ready(&self) -> Result<(), HeapError> {
        self.resolve()
    }

    fn raw_allocate(&self, size: usize) -> Option<NonNull<u8>> {
        match self.malloc_fn() {
            // SAFETY: real malloc accepts any size.
            Some(malloc) => NonNull::new(unsafe { malloc(size) }.cast()),
            None => BOOTSTRAP.alloc(size),
        }
    }

    fn raw_zero_allocate(&self, size: usize) -> Option<NonNull<u8>> {
        match self.calloc_fn() {
            // SAFETY: real calloc accepts any size.
            Some(calloc) => NonNull::new(unsafe { calloc(1, size) }.cast()),
            None => BOOTSTRAP.alloc(size),
        }
    }

    unsafe fn raw_resize(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        if BOOTSTRAP.contains(ptr.as_ptr()) {
            let old = BOOTSTRAP.chunk_size(ptr);
            let fresh = self.raw_allocate(size)?;
            ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old.min(size));
            return Some(fresh);
        }
        // A pointer outside the bootstrap arena came from the real malloc, so
        // resolution has already succeeded.
        let realloc = self.realloc_fn()?;
        NonNull::new(realloc(ptr.as_ptr().cast(), size).cast())
    }

    unsafe fn raw_release(&self, ptr: NonNull<u8>) {
        if BOOTSTRAP.contains(ptr.as_ptr()) {
            return;
        }
        if let Some(free) = self.free_fn() {
            free(ptr.as_ptr().cast());
        }
    }
}
