//! # heapwarden
//!
//! Transparent heap instrumentation for any dynamically linked process.
//!
//! ## Features
//!
//! - Double-release detection (atomic life state in every block header)
//! - Header corruption detection (a sentinel right before each user pointer,
//!   plus an optional trailing guard word)
//! - Leak summary at exit, with leaked blocks reclaimed or kept
//! - Thread-local fast path: the process registry lock is only taken when a
//!   thread registers, at fork boundaries and at shutdown
//! - Blocks can be released or resized from any thread
//! - `fork` safety via `pthread_atfork`
//! - Signal-safe, allocation-free diagnostics
//!
//! ## Preloading
//!
//! ```text
//! cargo build --release --features interpose
//! LD_PRELOAD=target/release/libheapwarden.so ./your_app
//! ```
//!
//! ## Embedding
//!
//! ```rust,no_run
//! use heapwarden::{LibcHeap, Tracker, TrackerConfig};
//!
//! let tracker = Tracker::new(LibcHeap, TrackerConfig::default());
//! let block = tracker.allocate(64);
//! unsafe { tracker.release(block.as_ptr()) };
//! assert!(tracker.sweep_leaks().unwrap().is_clean());
//! ```

pub mod api;
pub mod debug;
pub mod diagnostics;
pub mod process;

pub mod allocators;
pub mod core;
mod sync;
mod util;

#[cfg(feature = "interpose")]
pub mod ffi;

// Re-export public API at crate root for convenience
pub use api::config::{FatalAction, TrackerConfig};
pub use api::error::{ErrorCategory, HeapError, Operation};
pub use api::lifecycle::{Lifecycle, Phase};
pub use api::stats::{LeakReport, TrackerStats};
pub use api::tracker::{Tracker, MIN_ALIGN};

// Underlying allocators
pub use allocators::{LibcHeap, NextHeap, RawHeap, SymbolNames};

// Header model
pub use crate::core::{BlockHeader, LifeState, HEADER_SIZE, SENTINEL};

// Diagnostics
pub use diagnostics::{suppress_diagnostics, Diagnostic, DiagnosticKind};
pub use diagnostics::{HW001, HW002, HW003, HW004, HW101};
