//! Lock types.
//!
//! Both the per-owner chains and the process registry are locked from inside
//! `malloc`, so neither lock may allocate, not even when contended. A
//! parking mutex allocates its parking table the first time a thread has to
//! wait; [`RawSpinLock`] never parks and so never allocates.
//!
//! Per-owner chains use [`Mutex`], a `lock_api` mutex over the spin lock. The
//! process registry uses [`ForkLock`], a raw lock that can stay held across
//! `fork` and be rebuilt in the child.

use std::cell::UnsafeCell;
use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use parking_lot::lock_api::{self, GuardSend, RawMutex};

/// Spins before falling back to `sched_yield`.
const SPINS_BEFORE_YIELD: u32 = 64;

/// Test-and-test-and-set lock. Waiters spin, then yield to the scheduler.
pub struct RawSpinLock {
    locked: AtomicBool,
}

unsafe impl RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: RawSpinLock = RawSpinLock {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = GuardSend;

    #[inline]
    fn lock(&self) {
        let mut spins = 0u32;
        while !self.try_lock() {
            while self.locked.load(Ordering::Relaxed) {
                if spins < SPINS_BEFORE_YIELD {
                    spins += 1;
                    hint::spin_loop();
                } else {
                    thread::yield_now();
                }
            }
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// A mutex that never allocates.
pub type Mutex<T> = lock_api::Mutex<RawSpinLock, T>;

/// A raw lock whose acquire and release may happen in different calls.
///
/// Usable from inside `malloc` and from `pthread_atfork` handlers.
pub struct ForkLock {
    raw: UnsafeCell<RawSpinLock>,
}

// SAFETY: the inner lock is itself Sync; the UnsafeCell is only written
// through `reinit`, whose contract excludes concurrent access.
unsafe impl Sync for ForkLock {}
unsafe impl Send for ForkLock {}

impl ForkLock {
    /// Create an unlocked lock.
    pub const fn new() -> Self {
        Self {
            raw: UnsafeCell::new(RawSpinLock::INIT),
        }
    }

    /// Block until the lock is held.
    pub fn acquire(&self) {
        // SAFETY: shared access to the lock is the intended use.
        unsafe { (*self.raw.get()).lock() }
    }

    /// Release the lock.
    ///
    /// # Safety
    ///
    /// The lock must be held, by this thread or by the thread that called
    /// `fork` in the parent when this runs in the parent after `fork`.
    pub unsafe fn release(&self) {
        (*self.raw.get()).unlock()
    }

    /// Check whether someone holds the lock.
    pub fn is_held(&self) -> bool {
        // SAFETY: shared access to the lock is the intended use.
        unsafe { (*self.raw.get()).is_locked() }
    }

    /// Replace the lock with a fresh, unlocked one.
    ///
    /// # Safety
    ///
    /// No other thread may touch the lock. This holds in a freshly forked
    /// child, which has exactly one thread.
    pub unsafe fn reinit(&self) {
        std::ptr::write(self.raw.get(), RawSpinLock::INIT);
    }

    /// Run `f` with the lock held.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Unlock<'a>(&'a ForkLock);

        impl Drop for Unlock<'_> {
            fn drop(&mut self) {
                // SAFETY: acquired just before the guard was built.
                unsafe { self.0.release() }
            }
        }

        self.acquire();
        let _unlock = Unlock(self);
        f()
    }
}

impl Default for ForkLock {
    fn default() -> Self {
        Self::new()
    }
}
