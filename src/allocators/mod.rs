//! Underlying allocator bindings.
//!
//! heapwarden never manages memory itself; every byte comes from one of the
//! [`RawHeap`] implementations here. **These are the only modules that call
//! the real allocator.**

pub mod bootstrap;
pub mod heap;
pub mod next;

pub use heap::{LibcHeap, RawHeap};
pub use next::{NextHeap, SymbolNames};
