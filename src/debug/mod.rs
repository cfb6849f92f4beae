//! Debug utilities.
//!
//! Poisoning is controlled by [`TrackerConfig::poison`](crate::TrackerConfig),
//! which the `debug` feature turns on by default.

pub mod poison;
