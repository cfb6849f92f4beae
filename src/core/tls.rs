//! Thread-local owner cache.
//!
//! A single entry remembering which chain the current thread registered with
//! which tracker, so the registered path never touches the registry lock.

use std::cell::Cell;
use std::ptr::{self, NonNull};

use crate::core::chain::OwnerChain;

#[derive(Clone, Copy)]
struct CachedOwner {
    tracker: u64,
    epoch: u64,
    chain: *mut OwnerChain,
}

impl CachedOwner {
    const EMPTY: CachedOwner = CachedOwner {
        tracker: 0,
        epoch: 0,
        chain: ptr::null_mut(),
    };
}

thread_local! {
    // No destructor, so the slot stays readable while the thread is exiting.
    static OWNER: Cell<CachedOwner> = const { Cell::new(CachedOwner::EMPTY) };
}

/// Identity of the calling execution context.
pub fn context_id() -> u64 {
    // SAFETY: pthread_self has no preconditions.
    unsafe { libc::pthread_self() as u64 }
}

/// The cached chain for `(tracker, epoch)`, if this thread has one.
pub fn cached_owner(tracker: u64, epoch: u64) -> Option<NonNull<OwnerChain>> {
    OWNER
        .try_with(|slot| {
            let cached = slot.get();
            if cached.tracker == tracker && cached.epoch == epoch {
                NonNull::new(cached.chain)
            } else {
                None
            }
        })
        .ok()
        .flatten()
}

/// Remember `chain` as this thread's chain for `(tracker, epoch)`.
pub fn cache_owner(tracker: u64, epoch: u64, chain: NonNull<OwnerChain>) {
    let _ = OWNER.try_with(|slot| {
        slot.set(CachedOwner {
            tracker,
            epoch,
            chain: chain.as_ptr(),
        })
    });
}

/// Forget this thread's cached chain.
pub fn clear_owner() {
    let _ = OWNER.try_with(|slot| slot.set(CachedOwner::EMPTY));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_is_keyed_by_tracker_and_epoch() {
        let fake = NonNull::<OwnerChain>::dangling();
        cache_owner(9, 2, fake);

        assert_eq!(cached_owner(9, 2), Some(fake));
        assert_eq!(cached_owner(9, 3), None);
        assert_eq!(cached_owner(8, 2), None);

        clear_owner();
        assert_eq!(cached_owner(9, 2), None);
    }

    #[test]
    fn test_cache_is_per_thread() {
        cache_owner(4, 0, NonNull::dangling());
        let other = std::thread::spawn(|| cached_owner(4, 0).is_none()).join().unwrap();
        assert!(other);
        clear_owner();
    }

    #[test]
    fn test_context_ids_differ_between_threads() {
        let here = context_id();
        let there = std::thread::spawn(context_id).join().unwrap();
        assert_eq!(here, context_id());
        assert_ne!(here, there);
    }
}
