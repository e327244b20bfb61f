//! Audio processing module
//!
//! This module contains the sample-side building blocks of the playback loop:
//! - Sample specification and byte/time conversions ([`format`])
//! - Precomputed periodic test signal ([`signal`])
//! - Wrap-to-start ring reader over the signal ([`ring`])
//! - Underflow-driven latency policy and buffer attributes ([`latency`])

pub mod format;
pub mod latency;
pub mod ring;
pub mod signal;
