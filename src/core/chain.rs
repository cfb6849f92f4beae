//! Per-owner chains.
//!
//! Each execution context owns one chain: an intrusive doubly-linked list of
//! the headers it allocated. Only the owner pushes, but any context may
//! unlink a block in O(1) by locking the chain named in the block's header.

use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};

use crate::allocators::RawHeap;
use crate::core::header::BlockHeader;
use crate::sync::mutex::Mutex;

/// Counters kept by a chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainCounters {
    /// Blocks currently linked.
    pub blocks: usize,
    /// Requested bytes of the linked blocks.
    pub bytes: usize,
    /// Blocks ever pushed.
    pub allocations: u64,
    /// Blocks unlinked by a release or resize.
    pub releases: u64,
}

struct ChainState {
    head: *mut BlockHeader,
    counters: ChainCounters,
}

/// One execution context's chain of live blocks.
///
/// Chains are carved directly from the raw heap and are never tracked. They
/// outlive the thread that created them and are freed only when their
/// tracker is dropped.
pub struct OwnerChain {
    context: u64,
    epoch: u64,
    state: Mutex<ChainState>,
    /// Registry link, guarded by the registry lock.
    next: UnsafeCell<*mut OwnerChain>,
}

// Safety: `state` is behind a mutex, `next` is only touched under the
// registry lock, and the remaining fields are immutable.
unsafe impl Send for OwnerChain {}
unsafe impl Sync for OwnerChain {}

impl OwnerChain {
    /// Allocate an empty chain from `heap`.
    pub fn create<H: RawHeap>(heap: &H, context: u64, epoch: u64) -> Option<NonNull<OwnerChain>> {
        let chain = heap.raw_allocate(std::mem::size_of::<OwnerChain>())?.cast::<OwnerChain>();
        // SAFETY: freshly allocated, sized and (16-byte) aligned for OwnerChain.
        unsafe {
            chain.as_ptr().write(OwnerChain {
                context,
                epoch,
                state: Mutex::new(ChainState {
                    head: ptr::null_mut(),
                    counters: ChainCounters::default(),
                }),
                next: UnsafeCell::new(ptr::null_mut()),
            });
        }
        Some(chain)
    }

    /// Drop and free a chain.
    ///
    /// # Safety
    ///
    /// `chain` must come from [`create`](Self::create) with the same heap and
    /// must not be reachable by any other thread.
    pub unsafe fn destroy<H: RawHeap>(heap: &H, chain: NonNull<OwnerChain>) {
        ptr::drop_in_place(chain.as_ptr());
        heap.raw_release(chain.cast());
    }

    /// The context that created this chain.
    pub fn context(&self) -> u64 {
        self.context
    }

    /// The fork epoch this chain belongs to.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Current counters.
    pub fn counters(&self) -> ChainCounters {
        self.state.lock().counters
    }

    /// Link a header at the front of the chain and claim it.
    ///
    /// # Safety
    ///
    /// `header` must be initialized and not linked into any chain.
    pub unsafe fn push(&self, header: NonNull<BlockHeader>) {
        let h = header.as_ptr();
        let mut state = self.state.lock();

        (*h).owner = self;
        (*h).prev = ptr::null_mut();
        (*h).next = state.head;
        if !state.head.is_null() {
            (*state.head).prev = h;
        }
        state.head = h;

        state.counters.blocks += 1;
        state.counters.bytes += (*h).size;
        state.counters.allocations += 1;
    }

    /// Remove a header from the chain.
    ///
    /// # Safety
    ///
    /// `header` must currently be linked into this chain.
    pub unsafe fn unlink(&self, header: NonNull<BlockHeader>) {
        let mut state = self.state.lock();
        Self::splice_out(&mut state, header.as_ptr());
        state.counters.releases += 1;
    }

    unsafe fn splice_out(state: &mut ChainState, h: *mut BlockHeader) {
        let (prev, next) = ((*h).prev, (*h).next);
        if prev.is_null() {
            state.head = next;
        } else {
            (*prev).next = next;
        }
        if !next.is_null() {
            (*next).prev = prev;
        }
        (*h).prev = ptr::null_mut();
        (*h).next = ptr::null_mut();

        state.counters.blocks -= 1;
        state.counters.bytes -= (*h).size;
    }

    /// Visit every linked header. When `visit` returns `true` the header is
    /// unlinked before the walk moves on; it may then be freed by `visit`'s
    /// caller. The walk stops at the first error.
    ///
    /// # Safety
    ///
    /// Every linked header must be readable. `visit` must not touch this
    /// chain's lock.
    pub unsafe fn sweep<E>(
        &self,
        mut visit: impl FnMut(NonNull<BlockHeader>) -> Result<bool, E>,
        mut after_unlink: impl FnMut(NonNull<BlockHeader>),
    ) -> Result<(), E> {
        let mut state = self.state.lock();
        let mut cursor = state.head;
        while let Some(header) = NonNull::new(cursor) {
            cursor = (*header.as_ptr()).next;
            if visit(header)? {
                Self::splice_out(&mut state, header.as_ptr());
                after_unlink(header);
            }
        }
        Ok(())
    }

    pub(crate) fn registry_next(&self) -> *mut OwnerChain {
        // SAFETY: only called with the registry lock held.
        unsafe { *self.next.get() }
    }

    pub(crate) unsafe fn set_registry_next(&self, next: *mut OwnerChain) {
        *self.next.get() = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocators::LibcHeap;
    use crate::core::header::HEADER_SIZE;

    fn block(heap: &LibcHeap, size: usize) -> NonNull<BlockHeader> {
        let raw = heap.raw_allocate(HEADER_SIZE + size).unwrap();
        unsafe { BlockHeader::init(raw, 0, size, ptr::null()) }
    }

    fn free(heap: &LibcHeap, header: NonNull<BlockHeader>) {
        unsafe { heap.raw_release(BlockHeader::raw_base(header)) };
    }

    #[test]
    fn test_push_unlink_counts() {
        let heap = LibcHeap;
        let chain = OwnerChain::create(&heap, 7, 0).unwrap();
        let c = unsafe { chain.as_ref() };
        let (a, b, d) = (block(&heap, 10), block(&heap, 20), block(&heap, 30));

        unsafe {
            c.push(a);
            c.push(b);
            c.push(d);
            assert_eq!((*b.as_ptr()).owner, chain.as_ptr() as *const _);

            // Middle, head, then tail.
            c.unlink(b);
            c.unlink(d);
            assert_eq!(c.counters().blocks, 1);
            assert_eq!(c.counters().bytes, 10);
            c.unlink(a);
        }

        let counters = c.counters();
        assert_eq!(counters, ChainCounters { blocks: 0, bytes: 0, allocations: 3, releases: 3 });

        for h in [a, b, d] {
            free(&heap, h);
        }
        unsafe { OwnerChain::destroy(&heap, chain) };
    }

    #[test]
    fn test_unlink_from_another_thread() {
        let heap = LibcHeap;
        let chain = OwnerChain::create(&heap, 1, 0).unwrap();
        let header = block(&heap, 64);
        unsafe { chain.as_ref().push(header) };

        let (chain_addr, header_addr) = (chain.as_ptr() as usize, header.as_ptr() as usize);
        std::thread::spawn(move || unsafe {
            let chain = &*(chain_addr as *const OwnerChain);
            chain.unlink(NonNull::new_unchecked(header_addr as *mut BlockHeader));
        })
        .join()
        .unwrap();

        assert_eq!(unsafe { chain.as_ref() }.counters().blocks, 0);
        free(&heap, header);
        unsafe { OwnerChain::destroy(&heap, chain) };
    }

    #[test]
    fn test_sweep_unlinks_selected() {
        let heap = LibcHeap;
        let chain = OwnerChain::create(&heap, 1, 0).unwrap();
        let c = unsafe { chain.as_ref() };
        let keep = block(&heap, 5);
        let drop = block(&heap, 6);
        unsafe {
            c.push(keep);
            c.push(drop);
        }

        let mut unlinked = Vec::new();
        unsafe {
            c.sweep::<()>(|h| Ok((*h.as_ptr()).size == 6), |h| unlinked.push(h)).unwrap();
        }

        assert_eq!(unlinked, vec![drop]);
        assert_eq!(c.counters().blocks, 1);
        assert_eq!(c.counters().releases, 0);

        unsafe { c.unlink(keep) };
        free(&heap, keep);
        free(&heap, drop);
        unsafe { OwnerChain::destroy(&heap, chain) };
    }
}
