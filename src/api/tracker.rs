//! The allocation engine.
//!
//! A [`Tracker`] wraps a [`RawHeap`] and prefixes every block it hands out
//! with a [`BlockHeader`]. Blocks are linked into the allocating thread's
//! [`OwnerChain`]; any thread can release them because the header names its
//! chain.
//!
//! Every operation comes in two flavours:
//! - `try_*` returns a [`HeapError`]
//! - the plain form reports the error and terminates the process, which is
//!   what the C entry points use

use std::convert::Infallible;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::allocators::RawHeap;
use crate::api::config::TrackerConfig;
use crate::api::error::{HeapError, Operation};
use crate::api::stats::{LeakReport, TrackerStats};
use crate::core::header::{self, BlockHeader, LifeState, GUARD_SIZE, HEADER_SIZE};
use crate::core::registry::ProcessRegistry;
use crate::core::{tls, OwnerChain};
use crate::debug::poison;
use crate::diagnostics;
use crate::util::layout::{align_up, checked_total, is_aligned};

/// Alignment every block gets without asking.
pub const MIN_ALIGN: usize = 16;

static NEXT_TRACKER_ID: AtomicU64 = AtomicU64::new(1);

/// An isolated heap tracker.
///
/// The process-wide instance lives in [`process`](crate::process); tests
/// and embedders build their own.
pub struct Tracker<H: RawHeap> {
    heap: H,
    config: TrackerConfig,
    id: u64,
    epoch: AtomicU64,
    finalized: AtomicBool,
    registry: ProcessRegistry,
}

impl<H: RawHeap> Tracker<H> {
    /// Create a tracker over `heap`.
    pub fn new(heap: H, config: TrackerConfig) -> Self {
        Self {
            heap,
            config,
            id: NEXT_TRACKER_ID.fetch_add(1, Ordering::Relaxed),
            epoch: AtomicU64::new(0),
            finalized: AtomicBool::new(false),
            registry: ProcessRegistry::new(),
        }
    }

    /// Unique id of this tracker.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The configuration.
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// The underlying heap.
    pub fn heap(&self) -> &H {
        &self.heap
    }

    /// Current fork epoch. Starts at 0 and advances in every fork child.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Whether shutdown has begun. Releasing a block the shutdown sweep
    /// already freed is then a silent no-op.
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    pub(crate) fn set_finalized(&self) {
        self.finalized.store(true, Ordering::Release);
    }

    /// Report `err` and end the process.
    pub fn fail(&self, err: &HeapError) -> ! {
        diagnostics::fatal(err, self.config.fatal_action)
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate `size` uninitialized bytes.
    pub fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.heap.ensure_ready()?;
        let total = self.block_size(size)?;
        let owner = self.owner()?;
        let raw = self
            .heap
            .raw_allocate(total)
            .ok_or(HeapError::Exhausted { requested: total })?;

        // SAFETY: raw is a fresh 16-aligned allocation of `total` bytes.
        let user = unsafe { self.adopt(raw, 0, size, owner) };
        if self.config.poison {
            unsafe { poison::poison_fresh(user.as_ptr(), size) };
        }
        Ok(user)
    }

    /// Allocate `count * size` zeroed bytes.
    pub fn try_zero_allocate(&self, count: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        let bytes = count
            .checked_mul(size)
            .ok_or(HeapError::SizeOverflow { count, size })?;
        self.heap.ensure_ready()?;
        let total = self.block_size(bytes)?;
        let owner = self.owner()?;
        let raw = self
            .heap
            .raw_zero_allocate(total)
            .ok_or(HeapError::Exhausted { requested: total })?;

        // SAFETY: raw is a fresh 16-aligned allocation of `total` bytes.
        Ok(unsafe { self.adopt(raw, 0, bytes, owner) })
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// `align` is rounded up to a power of two; anything up to
    /// [`MIN_ALIGN`] is an ordinary allocation.
    pub fn try_allocate_aligned(&self, align: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        let align = align
            .checked_next_power_of_two()
            .ok_or(HeapError::SizeOverflow { count: size, size: align })?;
        if align <= MIN_ALIGN {
            return self.try_allocate(size);
        }

        self.heap.ensure_ready()?;
        let total = checked_total(&[size, self.overhead(), align - MIN_ALIGN])
            .ok_or(HeapError::SizeOverflow { count: size, size: align })?;
        let owner = self.owner()?;
        let raw = self
            .heap
            .raw_allocate(total)
            .ok_or(HeapError::Exhausted { requested: total })?;

        let base = raw.as_ptr() as usize;
        let offset = align_up(base + HEADER_SIZE, align) - HEADER_SIZE - base;
        // SAFETY: offset <= align - MIN_ALIGN keeps header, user region and
        // guard inside `total`; base + offset is 16-aligned.
        let user = unsafe { self.adopt(raw, offset, size, owner) };
        debug_assert!(is_aligned(user.as_ptr() as usize, align));
        if self.config.poison {
            unsafe { poison::poison_fresh(user.as_ptr(), size) };
        }
        Ok(user)
    }

    // =========================================================================
    // Resize and release
    // =========================================================================

    /// Resize a block, preserving the lesser of the old and new sizes.
    ///
    /// A null `ptr` is an allocation. The resized block joins the calling
    /// thread's chain. On failure the original block is left alive.
    ///
    /// Unlike [`try_release`](Self::try_release), a block reclaimed by the
    /// shutdown sweep is still a double release here, even after finalize:
    /// its contents were already handed back and cannot be carried over.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by this tracker.
    pub unsafe fn try_resize(&self, ptr: *mut u8, size: usize) -> Result<NonNull<u8>, HeapError> {
        let Some(user) = NonNull::new(ptr) else {
            return self.try_allocate(size);
        };
        self.heap.ensure_ready()?;

        let header = BlockHeader::from_user(user);
        header::check_integrity(header, self.config.trailing_guard)?;
        let total = self.block_size(size)?;
        let owner = self.owner()?;

        if header.as_ref().transition(LifeState::Released).is_err() {
            return Err(HeapError::DoubleRelease {
                block: user.as_ptr() as usize,
                operation: Operation::Resize,
            });
        }
        self.detach(header);
        let old_size = (*header.as_ptr()).size;

        if (*header.as_ptr()).base_offset != 0 {
            // Over-aligned blocks cannot go through realloc without losing
            // their alignment guarantee; move them to an ordinary block.
            let Some(raw) = self.heap.raw_allocate(total) else {
                self.reattach(header, owner);
                return Err(HeapError::Exhausted { requested: total });
            };
            let fresh = self.adopt(raw, 0, size, owner);
            ptr::copy_nonoverlapping(user.as_ptr(), fresh.as_ptr(), old_size.min(size));
            if self.config.poison {
                poison::poison_released(user.as_ptr(), old_size);
            }
            self.heap.raw_release(BlockHeader::raw_base(header));
            return Ok(fresh);
        }

        match self.heap.raw_resize(BlockHeader::raw_base(header), total) {
            Some(raw) => {
                let fresh = self.adopt(raw, 0, size, owner);
                if self.config.poison && size > old_size {
                    poison::poison_fresh(fresh.as_ptr().add(old_size), size - old_size);
                }
                Ok(fresh)
            }
            None => {
                self.reattach(header, owner);
                Err(HeapError::Exhausted { requested: total })
            }
        }
    }

    /// Release a block. Null is a no-op.
    ///
    /// Once finalized, releasing a block the shutdown sweep reclaimed is a
    /// no-op, since late destructors free what the sweep already freed.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by this tracker.
    pub unsafe fn try_release(&self, ptr: *mut u8) -> Result<(), HeapError> {
        let Some(user) = NonNull::new(ptr) else {
            return Ok(());
        };

        let header = BlockHeader::from_user(user);
        header::check_integrity(header, self.config.trailing_guard)?;
        match header.as_ref().transition(LifeState::Released) {
            Ok(()) => {}
            // A destructor running after the shutdown sweep already freed it.
            Err(Some(LifeState::Reclaimed)) if self.is_finalized() => return Ok(()),
            Err(_) => {
                return Err(HeapError::DoubleRelease {
                    block: user.as_ptr() as usize,
                    operation: Operation::Release,
                })
            }
        }

        self.detach(header);
        if self.config.poison {
            poison::poison_released(user.as_ptr(), (*header.as_ptr()).size);
        }
        self.heap.raw_release(BlockHeader::raw_base(header));
        Ok(())
    }

    /// Requested size of a block, 0 for null.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this tracker.
    pub unsafe fn usable_size(&self, ptr: *const u8) -> usize {
        match NonNull::new(ptr as *mut u8) {
            Some(user) => (*BlockHeader::from_user(user).as_ptr()).size,
            None => 0,
        }
    }

    // =========================================================================
    // Fail-fast forms
    // =========================================================================

    /// [`try_allocate`](Self::try_allocate), terminating on error.
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        self.try_allocate(size).unwrap_or_else(|err| self.fail(&err))
    }

    /// [`try_zero_allocate`](Self::try_zero_allocate), terminating on error.
    pub fn zero_allocate(&self, count: usize, size: usize) -> NonNull<u8> {
        self.try_zero_allocate(count, size)
            .unwrap_or_else(|err| self.fail(&err))
    }

    /// [`try_allocate_aligned`](Self::try_allocate_aligned), terminating on error.
    pub fn allocate_aligned(&self, align: usize, size: usize) -> NonNull<u8> {
        self.try_allocate_aligned(align, size)
            .unwrap_or_else(|err| self.fail(&err))
    }

    /// [`try_resize`](Self::try_resize), terminating on error.
    ///
    /// # Safety
    ///
    /// Same as [`try_resize`](Self::try_resize).
    pub unsafe fn resize(&self, ptr: *mut u8, size: usize) -> NonNull<u8> {
        self.try_resize(ptr, size).unwrap_or_else(|err| self.fail(&err))
    }

    /// [`try_release`](Self::try_release), terminating on error.
    ///
    /// # Safety
    ///
    /// Same as [`try_release`](Self::try_release).
    pub unsafe fn release(&self, ptr: *mut u8) {
        if let Err(err) = self.try_release(ptr) {
            self.fail(&err)
        }
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    /// Aggregate the counters of every chain in the current epoch.
    pub fn stats(&self) -> TrackerStats {
        let mut stats = TrackerStats::new();
        let _ = self.registry.try_for_each::<Infallible>(|chain| {
            stats.absorb(chain.counters());
            Ok(())
        });
        stats
    }

    /// Count the blocks still alive, freeing them if `reclaim_leaks` is set.
    ///
    /// Every swept header is validated first. Reclaimed blocks are unlinked,
    /// so a second sweep does not see them again; kept blocks stay linked and
    /// are counted by every sweep.
    pub fn sweep_leaks(&self) -> Result<LeakReport, HeapError> {
        self.sweep(self.config.reclaim_leaks, true)
    }

    fn sweep(&self, reclaim: bool, validate: bool) -> Result<LeakReport, HeapError> {
        let guard = self.config.trailing_guard;
        let mut report = LeakReport {
            blocks: 0,
            bytes: 0,
            reclaimed: reclaim,
        };

        self.registry.try_for_each(|chain| {
            // SAFETY: linked headers stay readable until unlinked; the
            // release closure only runs on headers the sweep just unlinked.
            unsafe {
                chain.sweep(
                    |header| {
                        if let Err(err) = header::check_integrity(header, guard) {
                            return if validate { Err(err) } else { Ok(false) };
                        }
                        let h = header.as_ref();
                        if h.state() != Some(LifeState::Alive) {
                            // Released concurrently; its releaser unlinks it.
                            return Ok(false);
                        }
                        if reclaim && h.transition(LifeState::Reclaimed).is_err() {
                            return Ok(false);
                        }
                        report.blocks += 1;
                        report.bytes += h.size;
                        Ok(reclaim)
                    },
                    |header| self.heap.raw_release(BlockHeader::raw_base(header)),
                )
            }
        })?;

        Ok(report)
    }

    // =========================================================================
    // Fork
    // =========================================================================

    /// Hold the registry lock across `fork`.
    pub fn prepare_fork(&self) {
        self.registry.prepare_fork();
    }

    /// Release the lock in the parent.
    ///
    /// # Safety
    ///
    /// Must follow [`prepare_fork`](Self::prepare_fork) on the same thread.
    pub unsafe fn parent_after_fork(&self) {
        self.registry.parent_after_fork();
    }

    /// Start a fresh epoch in the child.
    ///
    /// Chains inherited from the parent are abandoned. Blocks allocated
    /// before the fork can still be released; they just are not unlinked
    /// from their old chains.
    ///
    /// # Safety
    ///
    /// Must run in a fork child after [`prepare_fork`](Self::prepare_fork)
    /// ran in the parent.
    pub unsafe fn child_after_fork(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.registry.child_after_fork();
        tls::clear_owner();
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn overhead(&self) -> usize {
        if self.config.trailing_guard {
            HEADER_SIZE + GUARD_SIZE
        } else {
            HEADER_SIZE
        }
    }

    fn block_size(&self, size: usize) -> Result<usize, HeapError> {
        let overhead = self.overhead();
        checked_total(&[size, overhead]).ok_or(HeapError::SizeOverflow { count: size, size: overhead })
    }

    /// The calling thread's chain, registering it on first use.
    fn owner(&self) -> Result<NonNull<OwnerChain>, HeapError> {
        let epoch = self.epoch();
        if let Some(chain) = tls::cached_owner(self.id, epoch) {
            return Ok(chain);
        }
        let chain = self
            .registry
            .find_or_register(&self.heap, tls::context_id(), epoch)?;
        tls::cache_owner(self.id, epoch, chain);
        Ok(chain)
    }

    /// Write a header into `raw` and link it into `owner`.
    unsafe fn adopt(
        &self,
        raw: NonNull<u8>,
        offset: usize,
        size: usize,
        owner: NonNull<OwnerChain>,
    ) -> NonNull<u8> {
        let header = BlockHeader::init(raw, offset, size, owner.as_ptr());
        if self.config.trailing_guard {
            header::write_guard(header);
        }
        owner.as_ref().push(header);
        BlockHeader::user_ptr(header)
    }

    /// Put back a block claimed by a resize that could not complete.
    unsafe fn reattach(&self, header: NonNull<BlockHeader>, owner: NonNull<OwnerChain>) {
        header.as_ref().revive();
        owner.as_ref().push(header);
    }

    /// Unlink a claimed block from whichever chain holds it.
    ///
    /// Chains from an earlier fork epoch are left alone: their lock may have
    /// been held by a thread that does not exist in this process.
    unsafe fn detach(&self, header: NonNull<BlockHeader>) {
        if let Some(chain) = (*header.as_ptr()).owner.as_ref() {
            if chain.epoch() == self.epoch() {
                chain.unlink(header);
            }
        }
    }
}

impl<H: RawHeap + Default> Default for Tracker<H> {
    fn default() -> Self {
        Self::new(H::default(), TrackerConfig::default())
    }
}

impl<H: RawHeap> Drop for Tracker<H> {
    fn drop(&mut self) {
        let _ = self.sweep(true, false);
        // SAFETY: `&mut self` means no other thread can reach the chains.
        unsafe { self.registry.destroy_all(&self.heap) };
    }
}
