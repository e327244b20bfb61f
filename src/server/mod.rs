//! Audio server boundary
//!
//! The playback core talks to an audio server through [`AudioServer`]. A
//! server owns a single-threaded event loop: each call to
//! [`AudioServer::iterate`] pumps one iteration and dispatches whatever
//! events are pending to a [`PlaybackHandler`]. All callbacks therefore run
//! on the thread that pumps the loop, one at a time.
//!
//! Backends:
//! - [`cpal_backend::CpalServer`] plays through the system output device
//! - [`simulated::SimulatedServer`] is an in-process null sink

pub mod cpal_backend;
pub mod simulated;

use bitflags::bitflags;
use crossbeam_channel::Sender;
use serde::Serialize;
use std::time::Duration;

use crate::audio::format::SampleSpec;
use crate::audio::latency::{BufferAttr, ATTR_UNSET};
use crate::error::Result;

/// State of the connection context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContextState {
    /// Not connected yet
    Unconnected,
    /// Connection is being established
    Connecting,
    /// Client is authorizing itself
    Authorizing,
    /// Client is passing its name
    SettingName,
    /// Ready for stream creation
    Ready,
    /// Connection failed or was lost
    Failed,
    /// Connection was terminated cleanly
    Terminated,
}

impl ContextState {
    /// Whether the handshake is over, successfully or not
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Terminated)
    }

    /// Whether this state aborts the connection attempt
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }

    /// Whether the handshake is still in progress
    pub fn is_handshaking(self) -> bool {
        matches!(self, Self::Connecting | Self::Authorizing | Self::SettingName)
    }
}

bitflags! {
    /// Flags passed when connecting a playback stream
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamFlags: u32 {
        /// Interpolate latency between timing updates
        const INTERPOLATE_TIMING = 0x0002;
        /// Refresh timing information automatically
        const AUTO_TIMING_UPDATE = 0x0008;
        /// Let the server adjust device latency to the target length
        const ADJUST_LATENCY = 0x2000;
    }
}

impl StreamFlags {
    /// Flags used for the tone playback stream
    pub fn playback() -> Self {
        Self::INTERPOLATE_TIMING | Self::ADJUST_LATENCY | Self::AUTO_TIMING_UPDATE
    }
}

/// Where written bytes land in the server-side buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// Append after the current write position
    Relative,
    /// Write at an absolute byte offset
    Absolute(u64),
}

/// Events delivered by a server's event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// Context state changed
    StateChanged(ContextState),
    /// Server wants `length` more bytes
    WriteRequested(usize),
    /// Playback buffer ran dry
    Underflow,
    /// Interrupts a blocking iteration without doing anything
    Wakeup,
}

/// Playback stream operations available inside callbacks
pub trait PlaybackStream {
    /// Sample spec fixed at stream creation
    fn sample_spec(&self) -> &SampleSpec;

    /// Write bytes into the server-side buffer
    fn write(&mut self, data: &[u8], seek: SeekMode) -> Result<()>;

    /// Replace the buffer attributes; takes effect asynchronously
    fn set_buffer_attr(&mut self, attr: &BufferAttr) -> Result<()>;

    /// Currently applied buffer attributes
    fn buffer_attr(&self) -> BufferAttr;

    /// Time until a byte written now is heard
    fn latency(&self) -> Result<Duration>;
}

/// Receiver of event loop callbacks
pub trait PlaybackHandler {
    fn on_state_changed(&mut self, state: ContextState);

    fn on_write_requested(&mut self, stream: &mut dyn PlaybackStream, length: usize);

    fn on_underflow(&mut self, stream: &mut dyn PlaybackStream);
}

/// Connection to an audio server with its own event loop
pub trait AudioServer {
    /// Start connecting; progress is reported through state callbacks
    fn connect(&mut self, server: Option<&str>) -> Result<()>;

    /// Current context state
    fn context_state(&self) -> ContextState;

    /// Pump one loop iteration
    ///
    /// Waits up to `max_wait` (forever when None) for something to happen,
    /// then dispatches all pending events to `handler`. Returns the number
    /// of callbacks invoked.
    fn iterate(
        &mut self,
        max_wait: Option<Duration>,
        handler: &mut dyn PlaybackHandler,
    ) -> Result<usize>;

    /// Create the playback stream; requires a ready context
    fn create_stream(&mut self, name: &str, spec: &SampleSpec) -> Result<()>;

    /// Connect the stream to the default sink
    fn connect_playback(&mut self, attr: &BufferAttr, flags: StreamFlags) -> Result<()>;

    /// Handle that interrupts a blocking [`iterate`](Self::iterate) from any thread
    fn waker(&self) -> MainloopWaker;

    /// Release the stream and the context
    fn disconnect(&mut self);
}

/// Thread-safe handle that wakes a blocked event loop
#[derive(Debug, Clone)]
pub struct MainloopWaker {
    tx: Sender<ServerEvent>,
}

impl MainloopWaker {
    pub fn new(tx: Sender<ServerEvent>) -> Self {
        Self { tx }
    }

    /// Wake the loop; a no-op if the loop is gone or already has work queued
    pub fn wake(&self) {
        let _ = self.tx.try_send(ServerEvent::Wakeup);
    }
}

/// Invoke the handler callback for one event
///
/// Stream events arriving without a stream are dropped. Returns whether a
/// callback ran.
pub(crate) fn dispatch(
    event: ServerEvent,
    stream: Option<&mut dyn PlaybackStream>,
    handler: &mut dyn PlaybackHandler,
) -> bool {
    match (event, stream) {
        (ServerEvent::StateChanged(state), _) => {
            handler.on_state_changed(state);
            true
        }
        (ServerEvent::WriteRequested(length), Some(stream)) => {
            handler.on_write_requested(stream, length);
            true
        }
        (ServerEvent::Underflow, Some(stream)) => {
            handler.on_underflow(stream);
            true
        }
        (ServerEvent::Wakeup, _) => false,
        (event, None) => {
            tracing::debug!(?event, "Dropping stream event without a stream");
            false
        }
    }
}

/// Prebuffer threshold in bytes, resolving the unset sentinel to `tlength`
pub(crate) fn prebuf_bytes(attr: &BufferAttr) -> usize {
    if attr.prebuf == ATTR_UNSET {
        attr.tlength as usize
    } else {
        attr.prebuf as usize
    }
}

/// Bytes to request so that buffered plus outstanding data reaches `tlength`
///
/// Requests smaller than `minreq` (or one frame) are held back.
pub(crate) fn refill_request(
    attr: &BufferAttr,
    buffered: usize,
    requested: usize,
    frame_size: usize,
) -> Option<usize> {
    let missing = (attr.tlength as usize).saturating_sub(buffered + requested);
    let minimum = if attr.minreq == ATTR_UNSET {
        frame_size
    } else {
        (attr.minreq as usize).max(frame_size)
    };
    (missing > 0 && missing >= minimum).then_some(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::SampleSpec;

    #[test]
    fn test_state_classification() {
        assert!(ContextState::Ready.is_terminal());
        assert!(ContextState::Failed.is_terminal());
        assert!(ContextState::Terminated.is_failure());
        assert!(!ContextState::Ready.is_failure());
        assert!(ContextState::Authorizing.is_handshaking());
        assert!(!ContextState::Unconnected.is_handshaking());
        assert!(!ContextState::Connecting.is_terminal());
    }

    #[test]
    fn test_playback_flags() {
        let flags = StreamFlags::playback();
        assert!(flags.contains(StreamFlags::INTERPOLATE_TIMING));
        assert!(flags.contains(StreamFlags::ADJUST_LATENCY));
        assert!(flags.contains(StreamFlags::AUTO_TIMING_UPDATE));
    }

    #[test]
    fn test_refill_request() {
        let attr = BufferAttr::for_latency(20_000, &SampleSpec::default());
        assert_eq!(refill_request(&attr, 0, 0, 2), Some(1764));
        assert_eq!(refill_request(&attr, 1000, 500, 2), Some(264));
        assert_eq!(refill_request(&attr, 1764, 0, 2), None);
        assert_eq!(refill_request(&attr, 1763, 0, 2), None);
    }

    #[test]
    fn test_prebuf_defaults_to_target() {
        let mut attr = BufferAttr::for_latency(20_000, &SampleSpec::default());
        assert_eq!(prebuf_bytes(&attr), 1764);
        attr.prebuf = 100;
        assert_eq!(prebuf_bytes(&attr), 100);
    }

    #[test]
    fn test_waker_does_not_block_when_full() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let waker = MainloopWaker::new(tx);
        waker.wake();
        waker.wake();
        assert_eq!(rx.try_recv(), Ok(ServerEvent::Wakeup));
        assert!(rx.try_recv().is_err());
    }
}
