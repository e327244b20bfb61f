//! Playback statistics
//!
//! Keeps a bounded history of underflows and latency adjustments along with
//! running counters for the fill path, for the session summary.

pub mod store;
