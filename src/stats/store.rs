//! Event history and running counters of a playback session
//!
//! Histories are bounded; the oldest entries are dropped first.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Maximum number of events kept per history
const MAX_HISTORY_SIZE: usize = 1024;

/// A single underflow notification
#[derive(Debug, Clone, Serialize)]
pub struct UnderflowEvent {
    pub timestamp: DateTime<Utc>,
    /// Underflows since the last latency increase, including this one
    pub count: u32,
    /// Target latency when the underflow happened
    pub latency_usec: u64,
}

/// A latency increase
#[derive(Debug, Clone, Serialize)]
pub struct LatencyEvent {
    pub timestamp: DateTime<Utc>,
    pub from_usec: u64,
    pub to_usec: u64,
}

/// Running counters
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct RunningStats {
    /// Write requests served
    pub write_requests: u64,
    /// Bytes handed to the stream
    pub bytes_written: u64,
    /// Writes rejected by the stream
    pub write_failures: u64,
    /// Underflow notifications
    pub underflows: u64,
    /// Latency increases applied
    pub latency_increases: u64,
    /// Context state changes seen
    pub state_changes: u64,
    /// Last stream latency reported by the server (µs)
    pub stream_latency_usec: Option<u64>,
}

/// Statistics store for one playback session
#[derive(Debug)]
pub struct StatsStore {
    started: DateTime<Utc>,
    underflow_history: VecDeque<UnderflowEvent>,
    latency_history: VecDeque<LatencyEvent>,
    max_size: usize,
    stats: RunningStats,
}

impl StatsStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_HISTORY_SIZE)
    }

    /// Store keeping at most `max_size` events per history
    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            started: Utc::now(),
            underflow_history: VecDeque::with_capacity(max_size.min(MAX_HISTORY_SIZE)),
            latency_history: VecDeque::new(),
            max_size: max_size.max(1),
            stats: RunningStats::default(),
        }
    }

    /// Record a successful write of `bytes`
    pub fn record_write(&mut self, bytes: usize) {
        self.stats.write_requests += 1;
        self.stats.bytes_written += bytes as u64;
    }

    /// Record a write the stream rejected
    pub fn record_write_failure(&mut self) {
        self.stats.write_requests += 1;
        self.stats.write_failures += 1;
    }

    pub fn record_stream_latency(&mut self, latency_usec: u64) {
        self.stats.stream_latency_usec = Some(latency_usec);
    }

    pub fn record_state_change(&mut self) {
        self.stats.state_changes += 1;
    }

    /// Record an underflow
    ///
    /// # Arguments
    /// * `count` - Underflows since the last latency increase
    /// * `latency_usec` - Target latency at the time of the underflow
    pub fn record_underflow(&mut self, count: u32, latency_usec: u64) {
        push_bounded(
            &mut self.underflow_history,
            self.max_size,
            UnderflowEvent {
                timestamp: Utc::now(),
                count,
                latency_usec,
            },
        );
        self.stats.underflows += 1;
    }

    /// Record a latency increase
    pub fn record_latency_increase(&mut self, from_usec: u64, to_usec: u64) {
        push_bounded(
            &mut self.latency_history,
            self.max_size,
            LatencyEvent {
                timestamp: Utc::now(),
                from_usec,
                to_usec,
            },
        );
        self.stats.latency_increases += 1;
    }

    pub fn underflow_history(&self) -> &VecDeque<UnderflowEvent> {
        &self.underflow_history
    }

    pub fn latency_history(&self) -> &VecDeque<LatencyEvent> {
        &self.latency_history
    }

    pub fn stats(&self) -> &RunningStats {
        &self.stats
    }

    /// When recording started
    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    /// Latency steps as (seconds since start, new latency in ms) pairs
    pub fn latency_timeline(&self) -> Vec<(f64, f64)> {
        self.latency_history
            .iter()
            .map(|e| {
                let offset = (e.timestamp - self.started).num_milliseconds() as f64 / 1000.0;
                (offset, e.to_usec as f64 / 1000.0)
            })
            .collect()
    }
}

impl Default for StatsStore {
    fn default() -> Self {
        Self::new()
    }
}

fn push_bounded<T>(history: &mut VecDeque<T>, max_size: usize, event: T) {
    if history.len() >= max_size {
        history.pop_front();
    }
    history.push_back(event);
}
