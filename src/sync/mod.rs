//! Synchronization primitives.
//!
//! Provides the lock types used by the registries.

pub(crate) mod mutex;
