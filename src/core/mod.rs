//! Tracking core: block headers, owner chains, the process registry and
//! the thread-local owner cache.

pub mod chain;
pub mod header;
pub mod registry;
pub(crate) mod tls;

pub use chain::{ChainCounters, OwnerChain};
pub use header::{BlockHeader, LifeState, GUARD_SIZE, GUARD_WORD, HEADER_SIZE, SENTINEL};
pub use registry::ProcessRegistry;
