//! Public API for heapwarden.
//!
//! Most users only need [`Tracker`](tracker::Tracker), its configuration
//! and the error type.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod stats;
pub mod tracker;
