//! Heap error taxonomy.

use std::ffi::CStr;
use std::fmt;

use crate::diagnostics::kind::{Diagnostic, HW001, HW002, HW003, HW004};

/// The operation that touched a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// `free`
    Release,
    /// `realloc`
    Resize,
}

impl Operation {
    fn verb(self) -> &'static str {
        match self {
            Operation::Release => "release",
            Operation::Resize => "resize",
        }
    }
}

/// Broad class of a [`HeapError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The real allocator primitives could not be located.
    Resolution,
    /// The real allocator could not satisfy a request.
    Exhaustion,
    /// A header sentinel or trailing guard was overwritten.
    Integrity,
    /// A block was used after it had been released.
    DoubleRelease,
}

/// Errors detected by the tracker.
///
/// All of them are fatal when they reach the C entry points; the `try_*`
/// methods on [`Tracker`](crate::Tracker) return them instead so a harness
/// can observe them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// `dlsym` could not find a real allocator symbol.
    ResolutionFailed {
        /// The missing symbol.
        symbol: &'static CStr,
    },
    /// The real allocator returned null.
    Exhausted {
        /// Total bytes asked of the real allocator, header included.
        requested: usize,
    },
    /// A size computation overflowed before reaching the allocator.
    SizeOverflow {
        /// Element count (or requested size).
        count: usize,
        /// Element size (or header and guard overhead).
        size: usize,
    },
    /// The header sentinel does not hold the reserved constant.
    IntegrityViolation {
        /// User pointer of the damaged block.
        block: usize,
        /// The value found in place of the sentinel.
        found: u32,
    },
    /// The trailing guard word after the user region was overwritten.
    GuardViolation {
        /// User pointer of the damaged block.
        block: usize,
        /// The value found in place of the guard.
        found: u64,
    },
    /// The block was already released.
    DoubleRelease {
        /// User pointer of the block.
        block: usize,
        /// What was attempted on the released block.
        operation: Operation,
    },
}

impl HeapError {
    /// The taxonomy class of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            HeapError::ResolutionFailed { .. } => ErrorCategory::Resolution,
            HeapError::Exhausted { .. } | HeapError::SizeOverflow { .. } => ErrorCategory::Exhaustion,
            HeapError::IntegrityViolation { .. } | HeapError::GuardViolation { .. } => {
                ErrorCategory::Integrity
            }
            HeapError::DoubleRelease { .. } => ErrorCategory::DoubleRelease,
        }
    }

    /// The predefined diagnostic printed for this error.
    pub fn diagnostic(&self) -> &'static Diagnostic {
        match self.category() {
            ErrorCategory::Resolution => &HW003,
            ErrorCategory::Exhaustion => &HW004,
            ErrorCategory::Integrity => &HW001,
            ErrorCategory::DoubleRelease => &HW002,
        }
    }
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self.diagnostic().message;
        match self {
            HeapError::ResolutionFailed { symbol } => {
                write!(f, "{}: symbol `{}` not found", message, symbol.to_str().unwrap_or("?"))
            }
            HeapError::Exhausted { requested } => {
                write!(f, "{}: {} bytes requested", message, requested)
            }
            HeapError::SizeOverflow { count, size } => {
                write!(f, "{}: {} * {} overflows", message, count, size)
            }
            HeapError::IntegrityViolation { block, found } => write!(
                f,
                "{}: header sentinel of block {:#x} is {:#010x}",
                message, block, found
            ),
            HeapError::GuardViolation { block, found } => write!(
                f,
                "{}: trailing guard of block {:#x} is {:#018x}",
                message, block, found
            ),
            HeapError::DoubleRelease { block, operation } => {
                write!(f, "{}: {} of block {:#x}", message, operation.verb(), block)
            }
        }
    }
}

impl std::error::Error for HeapError {}
