//! In-process null sink
//!
//! Behaves like a minimal audio server without touching any device: the
//! handshake follows a script, the sink consumes bytes when told to (or at
//! the sample rate in real-time mode), and the usual write-request and
//! underflow events are generated from the server-side fill level.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::{
    dispatch, prebuf_bytes, refill_request, AudioServer, ContextState, MainloopWaker,
    PlaybackHandler, PlaybackStream, SeekMode, ServerEvent, StreamFlags,
};
use crate::audio::format::SampleSpec;
use crate::audio::latency::BufferAttr;
use crate::error::{PlaybackError, Result};

/// Sink clock granularity in real-time mode
const PACING_PERIOD: Duration = Duration::from_millis(10);

/// Capacity of the cross-thread wakeup channel
const WAKE_CHANNEL_SIZE: usize = 16;

/// Handshake of a healthy server
const DEFAULT_HANDSHAKE: [ContextState; 4] = [
    ContextState::Connecting,
    ContextState::Authorizing,
    ContextState::SettingName,
    ContextState::Ready,
];

/// Playback stream of a [`SimulatedServer`]
#[derive(Debug)]
pub struct SimulatedStream {
    name: String,
    spec: SampleSpec,
    attr: BufferAttr,
    attr_history: Vec<BufferAttr>,
    flags: StreamFlags,
    connected: bool,
    /// Bytes waiting in the server-side buffer
    buffered: usize,
    /// Bytes requested from the client and not yet written
    requested: usize,
    prebuffering: bool,
    underflows: u64,
    bytes_written: u64,
    write_count: u64,
    capture: Option<Vec<u8>>,
    fail_writes: bool,
}

impl SimulatedStream {
    fn new(name: &str, spec: SampleSpec, capture: bool) -> Self {
        Self {
            name: name.to_string(),
            spec,
            attr: BufferAttr::for_latency(0, &spec),
            attr_history: Vec::new(),
            flags: StreamFlags::empty(),
            connected: false,
            buffered: 0,
            requested: 0,
            prebuffering: true,
            underflows: 0,
            bytes_written: 0,
            write_count: 0,
            capture: capture.then(Vec::new),
            fail_writes: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Every attribute set pushed after connecting, oldest first
    pub fn attr_history(&self) -> &[BufferAttr] {
        &self.attr_history
    }

    /// Bytes currently buffered on the server side
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Bytes requested and not yet written
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Underflows the sink has reported
    pub fn underflows(&self) -> u64 {
        self.underflows
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    /// All written bytes in order, if capture is enabled
    pub fn captured(&self) -> Option<&[u8]> {
        self.capture.as_deref()
    }

    /// Drain `bytes` from the buffer as the sink would during playback
    ///
    /// Returns whether the sink ran dry, and the size of a new write request.
    fn consume(&mut self, bytes: usize) -> (bool, Option<usize>) {
        let mut underflow = false;

        if self.prebuffering && self.buffered > 0 && self.buffered >= prebuf_bytes(&self.attr) {
            self.prebuffering = false;
        }

        if !self.prebuffering && bytes > 0 {
            if self.buffered >= bytes {
                self.buffered -= bytes;
            } else {
                self.buffered = 0;
                self.prebuffering = true;
                self.underflows += 1;
                underflow = true;
            }
        }

        let request = refill_request(
            &self.attr,
            self.buffered,
            self.requested,
            self.spec.frame_size(),
        );
        if let Some(length) = request {
            self.requested += length;
        }

        (underflow, request)
    }

    /// Release whatever part of a `length` byte request was not written
    fn release_unwritten(&mut self, length: usize, written_before: u64) {
        let written = self.bytes_written.saturating_sub(written_before) as usize;
        self.requested = self
            .requested
            .saturating_sub(length.saturating_sub(written));
    }
}

impl PlaybackStream for SimulatedStream {
    fn sample_spec(&self) -> &SampleSpec {
        &self.spec
    }

    fn write(&mut self, data: &[u8], seek: SeekMode) -> Result<()> {
        if self.fail_writes {
            return Err(PlaybackError::Write("simulated write failure".into()));
        }
        if !self.connected {
            return Err(PlaybackError::Write("stream is not connected".into()));
        }
        if let SeekMode::Absolute(offset) = seek {
            return Err(PlaybackError::Write(format!(
                "absolute seek to {} not supported",
                offset
            )));
        }

        self.buffered += data.len();
        self.requested = self.requested.saturating_sub(data.len());
        self.bytes_written += data.len() as u64;
        self.write_count += 1;
        if let Some(capture) = self.capture.as_mut() {
            capture.extend_from_slice(data);
        }
        Ok(())
    }

    fn set_buffer_attr(&mut self, attr: &BufferAttr) -> Result<()> {
        self.attr = *attr;
        self.attr_history.push(*attr);
        Ok(())
    }

    fn buffer_attr(&self) -> BufferAttr {
        self.attr
    }

    fn latency(&self) -> Result<Duration> {
        Ok(Duration::from_micros(self.spec.bytes_to_usec(self.buffered)))
    }
}

#[derive(Debug, Default)]
struct Pacing {
    started: Option<Instant>,
    frames_played: u64,
}

/// Deterministic audio server without a device
///
/// # Example
/// ```
/// use pulseloop::server::simulated::SimulatedServer;
/// use pulseloop::server::{AudioServer, ContextState};
///
/// let mut server = SimulatedServer::new();
/// server.connect(None).unwrap();
/// assert_eq!(server.context_state(), ContextState::Unconnected);
/// ```
#[derive(Debug)]
pub struct SimulatedServer {
    handshake: Vec<ContextState>,
    pending_handshake: VecDeque<ContextState>,
    state: ContextState,
    queue: VecDeque<ServerEvent>,
    wake_tx: Sender<ServerEvent>,
    wake_rx: Receiver<ServerEvent>,
    stream: Option<SimulatedStream>,
    released_stream: Option<SimulatedStream>,
    capture_writes: bool,
    connect_error: Option<String>,
    stream_error: Option<String>,
    playback_error: Option<String>,
    pacing: Option<Pacing>,
    server_name: Option<String>,
    connect_calls: u32,
    disconnect_calls: u32,
}

impl SimulatedServer {
    /// Server with a healthy handshake, manual clock and write capture
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(WAKE_CHANNEL_SIZE);
        Self {
            handshake: DEFAULT_HANDSHAKE.to_vec(),
            pending_handshake: VecDeque::new(),
            state: ContextState::Unconnected,
            queue: VecDeque::new(),
            wake_tx,
            wake_rx,
            stream: None,
            released_stream: None,
            capture_writes: true,
            connect_error: None,
            stream_error: None,
            playback_error: None,
            pacing: None,
            server_name: None,
            connect_calls: 0,
            disconnect_calls: 0,
        }
    }

    /// Null sink that drains at the sample rate and keeps no copy of the audio
    pub fn realtime() -> Self {
        Self {
            pacing: Some(Pacing::default()),
            capture_writes: false,
            ..Self::new()
        }
    }

    /// Replace the handshake; one state is delivered per loop iteration
    pub fn with_handshake(mut self, states: impl IntoIterator<Item = ContextState>) -> Self {
        self.handshake = states.into_iter().collect();
        self
    }

    /// Make `connect` fail immediately
    pub fn with_connect_error(mut self, message: impl Into<String>) -> Self {
        self.connect_error = Some(message.into());
        self
    }

    /// Make `create_stream` fail
    pub fn with_stream_error(mut self, message: impl Into<String>) -> Self {
        self.stream_error = Some(message.into());
        self
    }

    /// Make `connect_playback` fail
    pub fn with_playback_error(mut self, message: impl Into<String>) -> Self {
        self.playback_error = Some(message.into());
        self
    }

    /// Live stream, if any
    pub fn stream(&self) -> Option<&SimulatedStream> {
        self.stream.as_ref()
    }

    /// Stream released by the last `disconnect`
    pub fn released_stream(&self) -> Option<&SimulatedStream> {
        self.released_stream.as_ref()
    }

    /// Server name passed to the last `connect`
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls
    }

    /// Events queued for the next iteration
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// Let the sink play `bytes`, queueing underflow and refill events
    pub fn play(&mut self, bytes: usize) {
        let Some(stream) = self.stream.as_mut().filter(|s| s.connected) else {
            return;
        };
        let (underflow, request) = stream.consume(bytes);
        if underflow {
            self.queue.push_back(ServerEvent::Underflow);
        }
        if let Some(length) = request {
            self.queue.push_back(ServerEvent::WriteRequested(length));
        }
    }

    /// Queue a write request of `length` bytes
    pub fn request_write(&mut self, length: usize) {
        if let Some(stream) = self.stream.as_mut() {
            stream.requested += length;
        }
        self.queue.push_back(ServerEvent::WriteRequested(length));
    }

    /// Queue an underflow notification
    pub fn inject_underflow(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.underflows += 1;
        }
        self.queue.push_back(ServerEvent::Underflow);
    }

    /// Queue a context state change
    pub fn inject_state(&mut self, state: ContextState) {
        self.queue.push_back(ServerEvent::StateChanged(state));
    }

    /// Make subsequent stream writes fail
    pub fn set_write_failure(&mut self, fail: bool) {
        if let Some(stream) = self.stream.as_mut() {
            stream.fail_writes = fail;
        }
    }

    fn wait(&mut self, max_wait: Option<Duration>) {
        if self.pacing.is_some() {
            let period = max_wait.map_or(PACING_PERIOD, |w| w.min(PACING_PERIOD));
            self.sleep(Some(period));
            self.advance_clock();
        } else {
            self.sleep(max_wait);
        }
    }

    fn sleep(&mut self, timeout: Option<Duration>) {
        let received = match timeout {
            Some(timeout) => match self.wake_rx.recv_timeout(timeout) {
                Ok(event) => Some(event),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            },
            None => self.wake_rx.recv().ok(),
        };
        if let Some(event) = received.filter(|e| *e != ServerEvent::Wakeup) {
            self.queue.push_back(event);
        }
    }

    fn advance_clock(&mut self) {
        let Some(stream) = self.stream.as_ref().filter(|s| s.connected) else {
            return;
        };
        let rate = stream.spec.rate as u64;
        let frame_size = stream.spec.frame_size();
        let Some(started) = self.pacing.as_ref().and_then(|p| p.started) else {
            return;
        };

        let total_frames = started.elapsed().as_micros() as u64 * rate / 1_000_000;
        let frames = match self.pacing.as_mut() {
            Some(pacing) => {
                let frames = total_frames.saturating_sub(pacing.frames_played);
                pacing.frames_played = total_frames;
                frames
            }
            None => 0,
        };
        self.play(frames as usize * frame_size);
    }
}

impl Default for SimulatedServer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioServer for SimulatedServer {
    fn connect(&mut self, server: Option<&str>) -> Result<()> {
        self.connect_calls += 1;
        if let Some(message) = &self.connect_error {
            return Err(PlaybackError::Connection(message.clone()));
        }
        self.server_name = server.map(str::to_string);
        self.pending_handshake = self.handshake.iter().copied().collect();
        Ok(())
    }

    fn context_state(&self) -> ContextState {
        self.state
    }

    fn iterate(
        &mut self,
        max_wait: Option<Duration>,
        handler: &mut dyn PlaybackHandler,
    ) -> Result<usize> {
        if self.queue.is_empty() {
            match self.pending_handshake.pop_front() {
                Some(state) => self.queue.push_back(ServerEvent::StateChanged(state)),
                None => self.wait(max_wait),
            }
        }
        while let Ok(event) = self.wake_rx.try_recv() {
            if event != ServerEvent::Wakeup {
                self.queue.push_back(event);
            }
        }

        let mut dispatched = 0;
        while let Some(event) = self.queue.pop_front() {
            if let ServerEvent::StateChanged(state) = event {
                self.state = state;
            }
            let written_before = self.stream.as_ref().map_or(0, |s| s.bytes_written);
            let stream = self.stream.as_mut().map(|s| s as &mut dyn PlaybackStream);
            if dispatch(event, stream, handler) {
                dispatched += 1;
            }
            if let (ServerEvent::WriteRequested(length), Some(stream)) = (event, &mut self.stream) {
                stream.release_unwritten(length, written_before);
            }
        }
        Ok(dispatched)
    }

    fn create_stream(&mut self, name: &str, spec: &SampleSpec) -> Result<()> {
        if self.state != ContextState::Ready {
            return Err(PlaybackError::StreamCreation(format!(
                "context not ready ({:?})",
                self.state
            )));
        }
        if let Some(message) = &self.stream_error {
            return Err(PlaybackError::StreamCreation(message.clone()));
        }
        self.stream = Some(SimulatedStream::new(name, *spec, self.capture_writes));
        Ok(())
    }

    fn connect_playback(&mut self, attr: &BufferAttr, flags: StreamFlags) -> Result<()> {
        if let Some(message) = &self.playback_error {
            return Err(PlaybackError::StreamCreation(message.clone()));
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| PlaybackError::StreamCreation("no stream created".into()))?;

        stream.attr = *attr;
        stream.flags = flags;
        stream.connected = true;

        // Initial fill up to the target length
        let initial = attr.tlength as usize;
        if initial > 0 {
            stream.requested = initial;
            self.queue.push_back(ServerEvent::WriteRequested(initial));
        }
        if let Some(pacing) = self.pacing.as_mut() {
            pacing.started = Some(Instant::now());
            pacing.frames_played = 0;
        }
        Ok(())
    }

    fn waker(&self) -> MainloopWaker {
        MainloopWaker::new(self.wake_tx.clone())
    }

    fn disconnect(&mut self) {
        self.disconnect_calls += 1;
        self.queue.clear();
        self.pending_handshake.clear();
        if let Some(stream) = self.stream.take() {
            self.released_stream = Some(stream);
        }
        self.state = ContextState::Terminated;
    }
}
