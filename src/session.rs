//! Per-connection playback state
//!
//! A [`PlaybackSession`] owns everything the server callbacks mutate: the
//! read cursor, the latency controller, the live buffer attributes and the
//! last seen context state. It is handed to the event loop by reference on
//! every pump, so all mutation happens on the loop thread.
//!
//! Provides:
//! - Fill callback: copy the requested bytes from the sample ring
//! - Underflow callback: grow latency and push new buffer attributes
//! - State callback: track the connection state machine

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::audio::format::SampleSpec;
use crate::audio::latency::{BufferAttr, LatencyController, LatencyPolicy, UnderflowOutcome};
use crate::audio::ring::SampleRing;
use crate::audio::signal::SampleBuffer;
use crate::config::PlaybackConfig;
use crate::error::Result;
use crate::server::{ContextState, PlaybackHandler, PlaybackStream, SeekMode};
use crate::stats::store::{LatencyEvent, RunningStats, StatsStore, UnderflowEvent};

/// Playback state for one connection attempt
#[derive(Debug)]
pub struct PlaybackSession {
    spec: SampleSpec,
    ring: SampleRing,
    latency: LatencyController,
    /// Attributes last pushed to the stream
    attr: BufferAttr,
    connection_state: ContextState,
    stats: StatsStore,
}

/// Snapshot of a session, printed when playback stops
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackSummary {
    pub connection_state: ContextState,
    /// Final target latency (µs)
    pub latency_usec: u64,
    /// Latency increases applied
    pub adjustments: u32,
    /// Underflows since the last increase
    pub pending_underflows: u32,
    /// Read cursor in samples
    pub cursor: usize,
    /// Times the cursor restarted at 0
    pub wraps: u64,
    pub stats: RunningStats,
    /// When the session started recording
    pub started: DateTime<Utc>,
    pub underflow_history: Vec<UnderflowEvent>,
    pub latency_history: Vec<LatencyEvent>,
    /// (seconds since start, latency in ms) after each increase
    pub latency_timeline: Vec<(f64, f64)>,
}

impl PlaybackSession {
    /// Session reading from `buffer` with the given latency policy
    pub fn new(buffer: Arc<SampleBuffer>, policy: LatencyPolicy) -> Self {
        let spec = *buffer.spec();
        let latency = LatencyController::new(policy);
        Self {
            attr: latency.buffer_attr(&spec),
            spec,
            ring: SampleRing::new(buffer),
            latency,
            connection_state: ContextState::Unconnected,
            stats: StatsStore::new(),
        }
    }

    /// Generate the sample buffer described by `config` and wrap it in a session
    pub fn from_config(config: &PlaybackConfig) -> Result<Self> {
        config.validate()?;
        let buffer = SampleBuffer::generate(config.waveform, config.spec(), config.buffer_samples);
        info!(
            samples = buffer.capacity(),
            bytes = buffer.byte_len(),
            waveform = ?config.waveform,
            "Sample buffer generated"
        );
        Ok(Self::new(Arc::new(buffer), config.latency))
    }

    pub fn spec(&self) -> &SampleSpec {
        &self.spec
    }

    pub fn ring(&self) -> &SampleRing {
        &self.ring
    }

    pub fn latency(&self) -> &LatencyController {
        &self.latency
    }

    /// Buffer attributes for the current target latency
    pub fn buffer_attr(&self) -> BufferAttr {
        self.attr
    }

    /// Last state reported by the context
    pub fn connection_state(&self) -> ContextState {
        self.connection_state
    }

    pub fn stats(&self) -> &StatsStore {
        &self.stats
    }

    pub fn summary(&self) -> PlaybackSummary {
        PlaybackSummary {
            connection_state: self.connection_state,
            latency_usec: self.latency.current_usec(),
            adjustments: self.latency.adjustments(),
            pending_underflows: self.latency.underflow_count(),
            cursor: self.ring.cursor(),
            wraps: self.ring.wraps(),
            stats: self.stats.stats().clone(),
            started: self.stats.started(),
            underflow_history: self.stats.underflow_history().iter().cloned().collect(),
            latency_history: self.stats.latency_history().iter().cloned().collect(),
            latency_timeline: self.stats.latency_timeline(),
        }
    }
}

impl PlaybackHandler for PlaybackSession {
    fn on_state_changed(&mut self, state: ContextState) {
        self.connection_state = state;
        self.stats.record_state_change();
        match state {
            ContextState::Ready => info!("Context ready"),
            ContextState::Failed | ContextState::Terminated => {
                warn!(?state, "Context entered terminal state")
            }
            _ => debug!(?state, "Context state changed"),
        }
    }

    fn on_write_requested(&mut self, stream: &mut dyn PlaybackStream, length: usize) {
        match stream.latency() {
            Ok(latency) => {
                let usec = latency.as_micros() as u64;
                self.stats.record_stream_latency(usec);
                debug!(latency_usec = usec, requested = length, "Write requested");
            }
            Err(e) => debug!("Latency unavailable: {}", e),
        }

        let data = self.ring.read(length);
        let written = data.len();
        match stream.write(data, SeekMode::Relative) {
            Ok(()) => self.stats.record_write(written),
            Err(e) => {
                error!(bytes = written, "Stream write failed: {}", e);
                self.stats.record_write_failure();
            }
        }
    }

    fn on_underflow(&mut self, stream: &mut dyn PlaybackStream) {
        let latency_usec = self.latency.current_usec();
        let outcome = self.latency.on_underflow();

        match outcome {
            UnderflowOutcome::Counted { count } => {
                self.stats.record_underflow(count, latency_usec);
                warn!(count, latency_usec, "underflow");
            }
            UnderflowOutcome::Saturated { count } => {
                self.stats.record_underflow(count, latency_usec);
                warn!(count, latency_usec, "underflow at latency ceiling");
            }
            UnderflowOutcome::Increased { from_usec, to_usec } => {
                self.stats
                    .record_underflow(self.latency.policy().threshold, from_usec);
                warn!(latency_usec = from_usec, "underflow");

                self.attr.retarget(to_usec, &self.spec);
                if let Err(e) = stream.set_buffer_attr(&self.attr) {
                    error!("Failed to update buffer attributes: {}", e);
                }
                self.stats.record_latency_increase(from_usec, to_usec);
                info!(
                    from_usec,
                    tlength = self.attr.tlength,
                    "latency increased to {}",
                    to_usec
                );
            }
        }
    }
}
