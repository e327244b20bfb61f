//! Pulseloop - adaptive-latency tone playback
//!
//! Continuously feeds a precomputed waveform into an audio server's output
//! stream. The connection handshake and the fill loop are both driven by a
//! single-threaded event loop; sustained underflow grows the stream's buffer
//! latency until playback is continuous or the latency ceiling is reached.
//!
//! Layout:
//! - [`audio`] sample format, waveform generation, ring reader, latency policy
//! - [`server`] the audio server boundary and its backends
//! - [`session`] per-connection playback state and callbacks
//! - [`driver`] event loop pumping, lifecycle and background spawning
//! - [`stats`] underflow and latency history
//! - [`config`] JSON configuration with defaults

pub mod audio;
pub mod config;
pub mod driver;
pub mod error;
pub mod server;
pub mod session;
pub mod stats;

pub use audio::format::{SampleFormat, SampleSpec};
pub use audio::latency::{BufferAttr, LatencyController};
pub use audio::ring::SampleRing;
pub use audio::signal::{SampleBuffer, Waveform};
pub use config::PlaybackConfig;
pub use driver::{spawn_playback, Backend, EventLoopDriver, PlaybackHandle, ShutdownHandle};
pub use error::{PlaybackError, Result};
pub use server::{AudioServer, ContextState, PlaybackHandler, PlaybackStream};
pub use session::{PlaybackSession, PlaybackSummary};
pub use stats::store::StatsStore;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default sample rate in Hz
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Default sample buffer capacity in samples
pub const DEFAULT_BUFFER_SAMPLES: usize = 300_000;

/// Starting buffer latency in microseconds
pub const DEFAULT_LATENCY_USEC: u64 = 20_000;

/// Latency ceiling in microseconds; growth stops at or below this value
pub const MAX_LATENCY_USEC: u64 = 2_000_000;

/// Consecutive underflows that trigger a latency increase
pub const UNDERFLOW_THRESHOLD: u32 = 6;
