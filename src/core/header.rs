//! Block header layout.
//!
//! Every tracked allocation looks like this:
//!
//! ```text
//! raw base       header (48 bytes)                       user pointer
//! |  padding  |  size prev next owner base_offset state sentinel | user bytes | guard? |
//! ```
//!
//! `state` and `sentinel` sit directly before the user pointer. An underwrite
//! hits the sentinel first, and the real allocator's free-list links, which
//! occupy the first words of a freed chunk, leave them intact.
//!
//! Known limits:
//! - a user write that stores exactly [`SENTINEL`] over the sentinel goes
//!   unnoticed
//! - double release relies on the header staying mapped after the first
//!   release; blocks the real allocator serves with `mmap` (1 MiB and up by
//!   default in glibc) are unmapped by it, and the second release faults
//!   on the header read

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::api::error::HeapError;
use crate::core::chain::OwnerChain;

/// The reserved value every live or released header carries.
pub const SENTINEL: u32 = 0xDEAD_C0DE;

/// The trailing guard word, when enabled.
pub const GUARD_WORD: u64 = 0xFDFD_FDFD_FDFD_FDFD;

/// Bytes reserved after the user region for the guard word.
pub const GUARD_SIZE: usize = size_of::<u64>();

/// Size of [`BlockHeader`]; user pointers sit this far past the header.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Life state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LifeState {
    /// Handed out and not yet released.
    Alive = 0xA11E,
    /// Released by its owner.
    Released = 0xF8EE,
    /// Freed by the shutdown sweep.
    Reclaimed = 0x5EE9,
}

impl LifeState {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0xA11E => Some(LifeState::Alive),
            0xF8EE => Some(LifeState::Released),
            0x5EE9 => Some(LifeState::Reclaimed),
            _ => None,
        }
    }
}

/// Metadata placed immediately before each user pointer.
#[repr(C, align(16))]
pub struct BlockHeader {
    /// Requested size of the user region.
    pub(crate) size: usize,
    /// Chain links, guarded by the owner chain's lock.
    pub(crate) prev: *mut BlockHeader,
    pub(crate) next: *mut BlockHeader,
    /// The chain holding this block.
    pub(crate) owner: *const OwnerChain,
    /// Distance from the raw allocation to this header.
    pub(crate) base_offset: usize,
    state: AtomicU32,
    sentinel: u32,
}

const _: () = assert!(HEADER_SIZE % 16 == 0);
#[cfg(target_pointer_width = "64")]
const _: () = assert!(HEADER_SIZE == 48);

impl BlockHeader {
    /// Write a fresh ALIVE header at `raw + base_offset`.
    ///
    /// # Safety
    ///
    /// `raw` must be valid for `base_offset + HEADER_SIZE` bytes and
    /// `raw + base_offset` must be 16-byte aligned.
    pub unsafe fn init(
        raw: NonNull<u8>,
        base_offset: usize,
        size: usize,
        owner: *const OwnerChain,
    ) -> NonNull<BlockHeader> {
        let header = raw.as_ptr().add(base_offset).cast::<BlockHeader>();
        header.write(BlockHeader {
            size,
            prev: std::ptr::null_mut(),
            next: std::ptr::null_mut(),
            owner,
            base_offset,
            state: AtomicU32::new(LifeState::Alive as u32),
            sentinel: SENTINEL,
        });
        NonNull::new_unchecked(header)
    }

    /// Recover the header from a user pointer.
    ///
    /// # Safety
    ///
    /// `user` must have been produced by [`user_ptr`](Self::user_ptr).
    pub unsafe fn from_user(user: NonNull<u8>) -> NonNull<BlockHeader> {
        NonNull::new_unchecked(user.as_ptr().sub(HEADER_SIZE).cast())
    }

    /// The user pointer for a header.
    pub fn user_ptr(header: NonNull<BlockHeader>) -> NonNull<u8> {
        // SAFETY: the user region always follows the header.
        unsafe { NonNull::new_unchecked(header.as_ptr().cast::<u8>().add(HEADER_SIZE)) }
    }

    /// The pointer the real allocator returned for this block.
    ///
    /// # Safety
    ///
    /// `header` must point to an initialized header.
    pub unsafe fn raw_base(header: NonNull<BlockHeader>) -> NonNull<u8> {
        let offset = (*header.as_ptr()).base_offset;
        NonNull::new_unchecked(header.as_ptr().cast::<u8>().sub(offset))
    }

    /// The current life state, or `None` if the state word is garbage.
    pub fn state(&self) -> Option<LifeState> {
        LifeState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Move ALIVE to `to`. Exactly one caller wins for a given block.
    ///
    /// On failure returns the state that was found instead.
    pub fn transition(&self, to: LifeState) -> Result<(), Option<LifeState>> {
        self.state
            .compare_exchange(
                LifeState::Alive as u32,
                to as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(LifeState::from_raw)
    }

    /// Force the state back to ALIVE after a claimed block was kept.
    pub(crate) fn revive(&self) {
        self.state.store(LifeState::Alive as u32, Ordering::Release);
    }
}

/// Validate the sentinel, and the trailing guard if `guard` is set.
///
/// # Safety
///
/// `header` must point to readable header memory (which is the case for any
/// pointer handed out by a tracker, released or not).
pub unsafe fn check_integrity(header: NonNull<BlockHeader>, guard: bool) -> Result<(), HeapError> {
    let h = header.as_ptr();
    let block = BlockHeader::user_ptr(header).as_ptr() as usize;

    let found = std::ptr::addr_of!((*h).sentinel).read_volatile();
    if found != SENTINEL {
        return Err(HeapError::IntegrityViolation { block, found });
    }

    if guard && (*h).state() == Some(LifeState::Alive) {
        let found = guard_ptr(header).read_unaligned();
        if found != GUARD_WORD {
            return Err(HeapError::GuardViolation { block, found });
        }
    }
    Ok(())
}

/// Write the guard word after the user region.
///
/// # Safety
///
/// The allocation must extend `GUARD_SIZE` bytes past the user region.
pub unsafe fn write_guard(header: NonNull<BlockHeader>) {
    guard_ptr(header).write_unaligned(GUARD_WORD);
}

unsafe fn guard_ptr(header: NonNull<BlockHeader>) -> *mut u64 {
    let size = (*header.as_ptr()).size;
    BlockHeader::user_ptr(header).as_ptr().add(size).cast::<u64>()
}
