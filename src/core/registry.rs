//! Process registry: the lock-protected list of every owner chain.
//!
//! The registry is consulted on first allocation by a context, at fork
//! boundaries, for statistics, and by the shutdown sweep. The allocation hot
//! path never takes its lock.

use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};

use crate::allocators::RawHeap;
use crate::api::error::HeapError;
use crate::core::chain::OwnerChain;
use crate::sync::mutex::ForkLock;

/// Intrusive list of [`OwnerChain`]s.
pub struct ProcessRegistry {
    lock: ForkLock,
    head: UnsafeCell<*mut OwnerChain>,
    contexts: UnsafeCell<usize>,
}

// Safety: `head` and `contexts` are only accessed with `lock` held, or from
// the single thread of a fork child.
unsafe impl Send for ProcessRegistry {}
unsafe impl Sync for ProcessRegistry {}

impl ProcessRegistry {
    /// Create an empty registry.
    pub const fn new() -> Self {
        Self {
            lock: ForkLock::new(),
            head: UnsafeCell::new(ptr::null_mut()),
            contexts: UnsafeCell::new(0),
        }
    }

    /// Find the chain for `context` or register a new one.
    ///
    /// Each context appears at most once.
    pub fn find_or_register<H: RawHeap>(
        &self,
        heap: &H,
        context: u64,
        epoch: u64,
    ) -> Result<NonNull<OwnerChain>, HeapError> {
        self.lock.with(|| {
            // SAFETY: lock held.
            unsafe {
                if let Some(chain) = self.find_locked(context) {
                    return Ok(chain);
                }

                let chain = OwnerChain::create(heap, context, epoch).ok_or(HeapError::Exhausted {
                    requested: std::mem::size_of::<OwnerChain>(),
                })?;
                chain.as_ref().set_registry_next(*self.head.get());
                *self.head.get() = chain.as_ptr();
                *self.contexts.get() += 1;
                Ok(chain)
            }
        })
    }

    unsafe fn find_locked(&self, context: u64) -> Option<NonNull<OwnerChain>> {
        let mut cursor = *self.head.get();
        while let Some(chain) = NonNull::new(cursor) {
            if chain.as_ref().context() == context {
                return Some(chain);
            }
            cursor = chain.as_ref().registry_next();
        }
        None
    }

    /// Number of registered contexts.
    pub fn contexts(&self) -> usize {
        // SAFETY: lock held.
        self.lock.with(|| unsafe { *self.contexts.get() })
    }

    /// Run `f` on every chain with the registry locked, stopping at the first
    /// error.
    pub fn try_for_each<E>(&self, mut f: impl FnMut(&OwnerChain) -> Result<(), E>) -> Result<(), E> {
        self.lock.with(|| {
            // SAFETY: lock held; chains stay alive while registered.
            let mut cursor = unsafe { *self.head.get() };
            while let Some(chain) = NonNull::new(cursor) {
                let chain = unsafe { chain.as_ref() };
                f(chain)?;
                cursor = chain.registry_next();
            }
            Ok(())
        })
    }

    /// Unregister and free every chain.
    ///
    /// # Safety
    ///
    /// No block may reach a chain afterwards, and `heap` must be the heap the
    /// chains were created with.
    pub unsafe fn destroy_all<H: RawHeap>(&self, heap: &H) {
        self.lock.with(|| {
            let mut cursor = *self.head.get();
            while let Some(chain) = NonNull::new(cursor) {
                cursor = chain.as_ref().registry_next();
                OwnerChain::destroy(heap, chain);
            }
            *self.head.get() = ptr::null_mut();
            *self.contexts.get() = 0;
        })
    }

    /// Take the registry lock ahead of `fork`.
    pub fn prepare_fork(&self) {
        self.lock.acquire();
    }

    /// Release the lock taken by [`prepare_fork`](Self::prepare_fork) in the
    /// parent.
    ///
    /// # Safety
    ///
    /// Must follow `prepare_fork` on the forking thread.
    pub unsafe fn parent_after_fork(&self) {
        self.lock.release();
    }

    /// Reset the registry in a fork child.
    ///
    /// The lock is rebuilt in place and the list emptied. The old chains are
    /// abandoned, not freed: their memory is a copy of the parent's and
    /// blocks allocated before the fork still point at them.
    ///
    /// # Safety
    ///
    /// Must run in the child, which has a single thread.
    pub unsafe fn child_after_fork(&self) {
        self.lock.reinit();
        *self.head.get() = ptr::null_mut();
        *self.contexts.get() = 0;
    }

    /// Whether the registry lock is held (test support).
    pub fn is_locked(&self) -> bool {
        self.lock.is_held()
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocators::LibcHeap;

    #[test]
    fn test_register_once_per_context() {
        let heap = LibcHeap;
        let registry = ProcessRegistry::new();

        let a = registry.find_or_register(&heap, 1, 0).unwrap();
        let b = registry.find_or_register(&heap, 2, 0).unwrap();
        let again = registry.find_or_register(&heap, 1, 0).unwrap();

        assert_eq!(a, again);
        assert_ne!(a, b);
        assert_eq!(registry.contexts(), 2);

        let mut seen = Vec::new();
        registry
            .try_for_each::<()>(|chain| {
                seen.push(chain.context());
                Ok(())
            })
            .unwrap();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);

        unsafe { registry.destroy_all(&heap) };
        assert_eq!(registry.contexts(), 0);
    }

    #[test]
    fn test_child_reset_empties_and_unlocks() {
        let heap = LibcHeap;
        let registry = ProcessRegistry::new();
        let orphan = registry.find_or_register(&heap, 1, 0).unwrap();

        registry.prepare_fork();
        assert!(registry.is_locked());
        unsafe { registry.child_after_fork() };

        assert!(!registry.is_locked());
        assert_eq!(registry.contexts(), 0);

        let fresh = registry.find_or_register(&heap, 1, 1).unwrap();
        assert_ne!(orphan, fresh);
        assert_eq!(unsafe { fresh.as_ref() }.epoch(), 1);

        unsafe {
            registry.destroy_all(&heap);
            OwnerChain::destroy(&heap, orphan);
        }
    }

    #[test]
    fn test_parent_after_fork_unlocks() {
        let registry = ProcessRegistry::new();
        registry.prepare_fork();
        unsafe { registry.parent_after_fork() };
        assert!(!registry.is_locked());
    }
}
