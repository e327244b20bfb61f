//! Audio server backed by the system output device
//!
//! The cpal output callback plays the role of the sound server: it drains a
//! lock-free byte ring, reports underflow when the ring runs dry, and asks
//! for more data whenever the fill level drops below the target length.
//! Requests and underflows travel to the event loop thread over a bounded
//! crossbeam channel, so the callbacks of [`PlaybackHandler`] always run on
//! the thread that calls [`AudioServer::iterate`].
//!
//! The device is always opened as f32 with its own channel count. Client
//! frames are decoded in the callback and copied to every output channel.
//! If the device rejects the client's sample rate its default rate is used,
//! and client frames are repeated or skipped to keep the playback speed.
//!
//! The connection handshake advances one state per loop iteration:
//!
//! ```text
//! Connecting --host--> Authorizing --device--> SettingName --config--> Ready
//!                                     \                         \
//!                                      +--> Failed               +--> Failed
//! ```

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleRate, Stream, StreamConfig, SupportedStreamConfig};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{
    dispatch, prebuf_bytes, refill_request, AudioServer, ContextState, MainloopWaker,
    PlaybackHandler, PlaybackStream, SeekMode, ServerEvent, StreamFlags,
};
use crate::audio::format::SampleSpec;
use crate::audio::latency::BufferAttr;
use crate::error::{PlaybackError, Result};

/// Server-side buffer size in microseconds of audio
const RING_CAPACITY_USEC: u64 = 4_000_000;

/// Pending events between the output callback and the loop thread
const EVENT_CHANNEL_SIZE: usize = 64;

/// Channel count used when the device reports no default config
const FALLBACK_CHANNELS: u16 = 2;

/// Output sink information
#[derive(Debug, Clone)]
pub struct SinkInfo {
    /// Device name
    pub name: String,
    /// Whether this is the default output device
    pub is_default: bool,
    /// Default output channel count
    pub channels: u16,
    /// Default output sample rate
    pub sample_rate: u32,
}

/// State shared between the output callback and the stream handle
#[derive(Debug)]
struct StreamShared {
    /// Odd while the attributes below are being replaced
    generation: AtomicU64,
    maxlength: AtomicU32,
    tlength: AtomicU32,
    prebuf: AtomicU32,
    minreq: AtomicU32,
    /// Bytes requested from the client and not yet written
    requested: AtomicUsize,
    /// Device latency reported by the last callback
    device_latency_usec: AtomicU64,
}

impl StreamShared {
    fn new(attr: &BufferAttr) -> Self {
        let shared = Self {
            generation: AtomicU64::new(0),
            maxlength: AtomicU32::new(0),
            tlength: AtomicU32::new(0),
            prebuf: AtomicU32::new(0),
            minreq: AtomicU32::new(0),
            requested: AtomicUsize::new(0),
            device_latency_usec: AtomicU64::new(0),
        };
        shared.store_attr(attr);
        shared
    }

    /// Publish a new attribute set
    ///
    /// Only the loop thread writes, so the generation needs no CAS.
    fn store_attr(&self, attr: &BufferAttr) {
        let generation = self.generation.load(Ordering::Relaxed);
        self.generation
            .store(generation.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        self.maxlength.store(attr.maxlength, Ordering::Relaxed);
        self.tlength.store(attr.tlength, Ordering::Relaxed);
        self.prebuf.store(attr.prebuf, Ordering::Relaxed);
        self.minreq.store(attr.minreq, Ordering::Relaxed);

        self.generation
            .store(generation.wrapping_add(2), Ordering::Release);
    }

    /// Read one consistent attribute set, retrying across a concurrent store
    fn attr(&self, fragsize: u32) -> BufferAttr {
        loop {
            let before = self.generation.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }

            let attr = BufferAttr {
                maxlength: self.maxlength.load(Ordering::Relaxed),
                tlength: self.tlength.load(Ordering::Relaxed),
                prebuf: self.prebuf.load(Ordering::Relaxed),
                minreq: self.minreq.load(Ordering::Relaxed),
                fragsize,
            };

            fence(Ordering::Acquire);
            if self.generation.load(Ordering::Relaxed) == before {
                return attr;
            }
        }
    }

    fn settle_request(&self, bytes: usize) {
        let _ = self
            .requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                Some(r.saturating_sub(bytes))
            });
    }
}

/// What one output callback did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct DrainOutcome {
    /// Playback ran out of data during this callback
    underflow: bool,
    /// New write request, already counted as outstanding
    request: Option<usize>,
}

/// Output callback state: turns client bytes into device frames
struct RingDrain {
    consumer: HeapCons<u8>,
    shared: Arc<StreamShared>,
    spec: SampleSpec,
    device_channels: usize,
    /// Client frames consumed per device frame
    step: f64,
    /// Position between the current and the next client frame
    phase: f64,
    /// Current client frame, decoded
    frame: Vec<f32>,
    scratch: Vec<u8>,
    prebuffering: bool,
}

impl RingDrain {
    fn new(
        consumer: HeapCons<u8>,
        shared: Arc<StreamShared>,
        spec: SampleSpec,
        device_channels: u16,
        device_rate: u32,
    ) -> Self {
        Self {
            consumer,
            shared,
            spec,
            device_channels: device_channels.max(1) as usize,
            step: spec.rate as f64 / device_rate.max(1) as f64,
            phase: 1.0,
            frame: vec![0.0; spec.channels as usize],
            scratch: vec![0; spec.frame_size()],
            prebuffering: true,
        }
    }

    /// Fill `out` (interleaved device frames) and post the resulting events
    fn render(&mut self, out: &mut [f32], events: &Sender<ServerEvent>) -> DrainOutcome {
        let outcome = self.drain(out);
        if outcome.underflow {
            let _ = events.try_send(ServerEvent::Underflow);
        }
        if let Some(length) = outcome.request {
            // A request the loop never sees must not stay outstanding
            if events.try_send(ServerEvent::WriteRequested(length)).is_err() {
                self.shared.settle_request(length);
            }
        }
        outcome
    }

    /// Fill `out` from the ring; silence while prebuffering or starved
    fn drain(&mut self, out: &mut [f32]) -> DrainOutcome {
        let attr = self.shared.attr(0);
        let available = self.consumer.occupied_len();
        if self.prebuffering && available > 0 && available >= prebuf_bytes(&attr) {
            self.prebuffering = false;
        }

        let mut filled = 0;
        if !self.prebuffering {
            'frames: for device_frame in out.chunks_mut(self.device_channels) {
                while self.phase >= 1.0 {
                    if !self.next_frame() {
                        break 'frames;
                    }
                    self.phase -= 1.0;
                }
                for (channel, sample) in device_frame.iter_mut().enumerate() {
                    *sample = self.frame[channel % self.frame.len()];
                }
                self.phase += self.step;
                filled += device_frame.len();
            }
        }
        out[filled..].fill(0.0);

        let underflow = !self.prebuffering && filled < out.len();
        if underflow {
            self.prebuffering = true;
            self.phase = 1.0;
        }

        let buffered = self.consumer.occupied_len();
        let requested = self.shared.requested.load(Ordering::Acquire);
        let request = refill_request(&attr, buffered, requested, self.spec.frame_size());
        if let Some(length) = request {
            self.shared.requested.fetch_add(length, Ordering::AcqRel);
        }

        DrainOutcome { underflow, request }
    }

    /// Pop and decode the next client frame
    fn next_frame(&mut self) -> bool {
        if self.consumer.occupied_len() < self.scratch.len() {
            return false;
        }
        self.consumer.pop_slice(&mut self.scratch);
        let sample_size = self.spec.sample_size();
        for (value, bytes) in self
            .frame
            .iter_mut()
            .zip(self.scratch.chunks_exact(sample_size))
        {
            *value = self.spec.format.decode(bytes);
        }
        true
    }
}

/// Playback stream writing into the byte ring
struct CpalStream {
    name: String,
    spec: SampleSpec,
    attr: BufferAttr,
    producer: HeapProd<u8>,
    /// Handed to the output callback on `connect_playback`
    consumer: Option<HeapCons<u8>>,
    ring_capacity: usize,
    shared: Arc<StreamShared>,
    bytes_written: u64,
    stream: Option<Stream>,
}

impl CpalStream {
    /// Release whatever part of a `length` byte request was not written
    fn release_unwritten(&self, length: usize, written_before: u64) {
        let written = self.bytes_written.saturating_sub(written_before) as usize;
        self.shared.settle_request(length.saturating_sub(written));
    }
}

impl PlaybackStream for CpalStream {
    fn sample_spec(&self) -> &SampleSpec {
        &self.spec
    }

    fn write(&mut self, data: &[u8], seek: SeekMode) -> Result<()> {
        if self.stream.is_none() {
            return Err(PlaybackError::Write(format!(
                "stream '{}' is not connected",
                self.name
            )));
        }
        if let SeekMode::Absolute(offset) = seek {
            return Err(PlaybackError::Write(format!(
                "absolute seek to {} not supported",
                offset
            )));
        }

        let vacant = self.producer.vacant_len();
        if data.len() > vacant {
            return Err(PlaybackError::Write(format!(
                "buffer overrun: {} bytes written, {} free",
                data.len(),
                vacant
            )));
        }

        let pushed = self.producer.push_slice(data);
        self.bytes_written += pushed as u64;
        self.shared.settle_request(pushed);
        Ok(())
    }

    fn set_buffer_attr(&mut self, attr: &BufferAttr) -> Result<()> {
        let mut attr = *attr;
        if attr.maxlength as usize > self.ring_capacity {
            tracing::warn!(
                requested = attr.maxlength,
                capacity = self.ring_capacity,
                "maxlength exceeds server buffer, clamping"
            );
            attr.maxlength = self.ring_capacity as u32;
            attr.tlength = attr.tlength.min(attr.maxlength);
        }
        self.attr = attr;
        self.shared.store_attr(&attr);
        Ok(())
    }

    fn buffer_attr(&self) -> BufferAttr {
        self.shared.attr(self.attr.fragsize)
    }

    fn latency(&self) -> Result<Duration> {
        let buffered = self.spec.bytes_to_usec(self.producer.occupied_len());
        let device = self.shared.device_latency_usec.load(Ordering::Relaxed);
        Ok(Duration::from_micros(buffered + device))
    }
}

/// Audio server playing through cpal's default host
pub struct CpalServer {
    client_name: String,
    state: ContextState,
    events_tx: Sender<ServerEvent>,
    events_rx: Receiver<ServerEvent>,
    requested_device: Option<String>,
    host: Option<Host>,
    device: Option<Device>,
    /// Device default config, queried during the handshake
    output_config: Option<SupportedStreamConfig>,
    stream: Option<CpalStream>,
}

impl CpalServer {
    /// Create an unconnected server context named `client_name`
    pub fn new(client_name: &str) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::bounded(EVENT_CHANNEL_SIZE);
        Self {
            client_name: client_name.to_string(),
            state: ContextState::Unconnected,
            events_tx,
            events_rx,
            requested_device: None,
            host: None,
            device: None,
            output_config: None,
            stream: None,
        }
    }

    /// List output devices of the default host
    pub fn list_sinks() -> Result<Vec<SinkInfo>> {
        let host = cpal::default_host();
        let default_name = host.default_output_device().and_then(|d| d.name().ok());

        let devices = host
            .output_devices()
            .map_err(|e| PlaybackError::Connection(e.to_string()))?;

        let mut sinks = Vec::new();
        for device in devices {
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            let (channels, sample_rate) = device
                .default_output_config()
                .map(|c| (c.channels(), c.sample_rate().0))
                .unwrap_or((0, 0));
            sinks.push(SinkInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                name,
                channels,
                sample_rate,
            });
        }
        Ok(sinks)
    }

    fn set_state(&mut self, state: ContextState) {
        self.state = state;
        let _ = self.events_tx.try_send(ServerEvent::StateChanged(state));
    }

    /// Perform the next handshake step and return the resulting state
    fn advance_handshake(&mut self) -> ContextState {
        match self.state {
            ContextState::Connecting => {
                self.host = Some(cpal::default_host());
                ContextState::Authorizing
            }
            ContextState::Authorizing => match self.find_device() {
                Some(device) => {
                    self.device = Some(device);
                    ContextState::SettingName
                }
                None => {
                    tracing::error!(
                        device = ?self.requested_device,
                        "No output device available"
                    );
                    ContextState::Failed
                }
            },
            ContextState::SettingName => {
                let Some(device) = self.device.as_ref() else {
                    return ContextState::Failed;
                };
                match device.default_output_config() {
                    Ok(config) => {
                        tracing::info!(
                            client = %self.client_name,
                            device = %device.name().unwrap_or_default(),
                            rate = config.sample_rate().0,
                            channels = config.channels(),
                            "Audio server context ready"
                        );
                        self.output_config = Some(config);
                        ContextState::Ready
                    }
                    Err(e) => {
                        tracing::error!("Failed to query output config: {}", e);
                        ContextState::Failed
                    }
                }
            }
            other => other,
        }
    }

    fn find_device(&self) -> Option<Device> {
        let host = self.host.as_ref()?;
        match self.requested_device.as_deref() {
            Some(name) => host
                .output_devices()
                .ok()?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false)),
            None => host.default_output_device(),
        }
    }
}

impl AudioServer for CpalServer {
    fn connect(&mut self, server: Option<&str>) -> Result<()> {
        if self.state.is_handshaking() || self.state == ContextState::Ready {
            return Err(PlaybackError::Connection("context already connected".into()));
        }
        self.requested_device = server.map(str::to_string);
        self.set_state(ContextState::Connecting);
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
        if self.state.is_handshaking() && self.events_rx.is_empty() {
            let next = self.advance_handshake();
            self.set_state(next);
        }

        let first = match max_wait {
            None => self.events_rx.recv().ok(),
            Some(timeout) => match self.events_rx.recv_timeout(timeout) {
                Ok(event) => Some(event),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            },
        };

        let mut dispatched = 0;
        let mut next = first;
        while let Some(event) = next {
            if let ServerEvent::StateChanged(state) = event {
                self.state = state;
            }
            let written_before = self.stream.as_ref().map_or(0, |s| s.bytes_written);
            let stream = self.stream.as_mut().map(|s| s as &mut dyn PlaybackStream);
            if dispatch(event, stream, handler) {
                dispatched += 1;
            }
            if let (ServerEvent::WriteRequested(length), Some(stream)) = (event, &self.stream) {
                stream.release_unwritten(length, written_before);
            }
            next = self.events_rx.try_recv().ok();
        }
        Ok(dispatched)
    }

    fn create_stream(&mut self, name: &str, spec: &SampleSpec) -> Result<()> {
        if self.state != ContextState::Ready || self.device.is_none() {
            return Err(PlaybackError::StreamCreation(format!(
                "context not ready ({:?})",
                self.state
            )));
        }
        if !spec.is_valid() {
            return Err(PlaybackError::StreamCreation(format!(
                "invalid sample spec {:?}",
                spec
            )));
        }

        let ring_capacity = spec
            .usec_to_bytes(RING_CAPACITY_USEC)
            .max(spec.frame_size());
        let (producer, consumer) = HeapRb::<u8>::new(ring_capacity).split();
        let attr = BufferAttr::for_latency(0, spec);

        self.stream = Some(CpalStream {
            name: name.to_string(),
            spec: *spec,
            attr,
            producer,
            consumer: Some(consumer),
            ring_capacity,
            shared: Arc::new(StreamShared::new(&attr)),
            bytes_written: 0,
            stream: None,
        });
        tracing::debug!(stream = name, ring_capacity, "Stream created");
        Ok(())
    }

    fn connect_playback(&mut self, attr: &BufferAttr, flags: StreamFlags) -> Result<()> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| PlaybackError::StreamCreation("no output device".into()))?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| PlaybackError::StreamCreation("no stream created".into()))?;
        let consumer = stream
            .consumer
            .take()
            .ok_or_else(|| PlaybackError::StreamCreation("stream already connected".into()))?;

        stream.set_buffer_attr(attr)?;

        let device_channels = self
            .output_config
            .as_ref()
            .map(|c| c.channels())
            .unwrap_or(FALLBACK_CHANNELS);
        let device_rate = self
            .output_config
            .as_ref()
            .map(|c| c.sample_rate().0)
            .unwrap_or(stream.spec.rate);
        let rate = negotiate_rate(device, device_channels, stream.spec.rate, device_rate)?;
        let config = StreamConfig {
            channels: device_channels,
            sample_rate: SampleRate(rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let drain = RingDrain::new(
            consumer,
            Arc::clone(&stream.shared),
            stream.spec,
            device_channels,
            rate,
        );
        let output = build_output_stream(device, &config, drain, self.events_tx.clone())?;

        // Initial fill up to the target length
        let initial = stream.attr.tlength as usize;
        if initial > 0 {
            stream.shared.requested.store(initial, Ordering::Release);
            let _ = self.events_tx.try_send(ServerEvent::WriteRequested(initial));
        }

        output
            .play()
            .map_err(|e| PlaybackError::StreamCreation(e.to_string()))?;
        stream.stream = Some(output);

        tracing::info!(
            stream = %stream.name,
            rate = stream.spec.rate,
            channels = stream.spec.channels,
            format = ?stream.spec.format,
            device_rate = rate,
            device_channels,
            tlength = stream.attr.tlength,
            ?flags,
            "Playback stream connected"
        );
        Ok(())
    }

    fn waker(&self) -> MainloopWaker {
        MainloopWaker::new(self.events_tx.clone())
    }

    fn disconnect(&mut self) {
        self.stream = None;
        self.output_config = None;
        self.device = None;
        self.host = None;
        while self.events_rx.try_recv().is_ok() {}
        self.state = ContextState::Terminated;
        tracing::debug!(client = %self.client_name, "Context disconnected");
    }
}

/// Pick the output rate: the client's rate if the device takes it, else the device default
fn negotiate_rate(
    device: &Device,
    channels: u16,
    client_rate: u32,
    device_rate: u32,
) -> Result<u32> {
    let rates_to_try = if device_rate != client_rate {
        vec![client_rate, device_rate]
    } else {
        vec![client_rate]
    };

    for &rate in &rates_to_try {
        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(rate),
            buffer_size: cpal::BufferSize::Default,
        };
        match device.build_output_stream(
            &config,
            |_: &mut [f32], _: &cpal::OutputCallbackInfo| {},
            |_| {},
            None,
        ) {
            Ok(_stream) => {
                if rate != client_rate {
                    tracing::warn!(
                        "Configured rate {} Hz failed, using device default {} Hz",
                        client_rate,
                        rate
                    );
                }
                return Ok(rate);
            }
            Err(e) => tracing::warn!("Sample rate {} Hz failed: {}", rate, e),
        }
    }

    Err(PlaybackError::StreamCreation(format!(
        "device accepts neither {} Hz nor {} Hz",
        client_rate, device_rate
    )))
}

/// Build the f32 output stream driven by `drain`
fn build_output_stream(
    device: &Device,
    config: &StreamConfig,
    mut drain: RingDrain,
    events: Sender<ServerEvent>,
) -> Result<Stream> {
    let error_events = events.clone();

    device
        .build_output_stream(
            config,
            move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
                let timestamp = info.timestamp();
                if let Some(delay) = timestamp.playback.duration_since(&timestamp.callback) {
                    drain
                        .shared
                        .device_latency_usec
                        .store(delay.as_micros() as u64, Ordering::Relaxed);
                }
                drain.render(data, &events);
            },
            move |err| {
                tracing::error!("Output stream error: {}", err);
                if let cpal::StreamError::DeviceNotAvailable = err {
                    let _ = error_events.try_send(ServerEvent::StateChanged(ContextState::Failed));
                }
            },
            None,
        )
        .map_err(|e| PlaybackError::StreamCreation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::SampleFormat;

    struct NullHandler;

    impl PlaybackHandler for NullHandler {
        fn on_state_changed(&mut self, _state: ContextState) {}
        fn on_write_requested(&mut self, _stream: &mut dyn PlaybackStream, _length: usize) {}
        fn on_underflow(&mut self, _stream: &mut dyn PlaybackStream) {}
    }

    /// Mono s16 drain at 20 ms latency feeding a stereo device
    fn drain(device_channels: u16, device_rate: u32) -> (HeapProd<u8>, RingDrain) {
        let spec = SampleSpec::default();
        let attr = BufferAttr::for_latency(20_000, &spec);
        let (producer, consumer) = HeapRb::<u8>::new(16_384).split();
        let shared = Arc::new(StreamShared::new(&attr));
        let drain = RingDrain::new(consumer, shared, spec, device_channels, device_rate);
        (producer, drain)
    }

    fn push_samples(producer: &mut HeapProd<u8>, samples: &[i16]) {
        for sample in samples {
            producer.push_slice(&sample.to_le_bytes());
        }
    }

    #[test]
    fn test_server_creation() {
        let server = CpalServer::new("pulseloop-test");
        assert_eq!(server.context_state(), ContextState::Unconnected);
        assert!(server.output_config.is_none());
    }

    #[test]
    fn test_create_stream_before_ready_fails() {
        let mut server = CpalServer::new("pulseloop-test");
        let result = server.create_stream("Playback", &SampleSpec::default());
        assert!(matches!(result, Err(PlaybackError::StreamCreation(_))));
    }

    #[test]
    fn test_handshake_reaches_terminal_state() {
        // Outcome depends on the machine's audio devices; the handshake must
        // still terminate within a handful of iterations.
        let mut server = CpalServer::new("pulseloop-test");
        server.connect(None).unwrap();
        let mut handler = NullHandler;
        for _ in 0..8 {
            if server.context_state().is_terminal() {
                break;
            }
            server
                .iterate(Some(Duration::from_millis(100)), &mut handler)
                .unwrap();
        }
        assert!(server.context_state().is_terminal());
        server.disconnect();
        assert_eq!(server.context_state(), ContextState::Terminated);
    }

    #[test]
    fn test_double_connect_rejected() {
        let mut server = CpalServer::new("pulseloop-test");
        server.connect(None).unwrap();
        assert!(server.connect(None).is_err());
    }

    #[test]
    fn test_list_sinks_does_not_panic() {
        match CpalServer::list_sinks() {
            Ok(sinks) => {
                for sink in &sinks {
                    println!("  - {} ({} ch @ {} Hz)", sink.name, sink.channels, sink.sample_rate);
                }
            }
            Err(e) => println!("No audio devices available: {}", e),
        }
    }

    #[test]
    fn test_shared_request_settles() {
        let shared = StreamShared::new(&BufferAttr::for_latency(20_000, &SampleSpec::default()));
        shared.requested.store(100, Ordering::Release);
        shared.settle_request(40);
        assert_eq!(shared.requested.load(Ordering::Acquire), 60);
        shared.settle_request(500);
        assert_eq!(shared.requested.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_attr_reads_are_never_torn() {
        let spec = SampleSpec::default();
        let small = BufferAttr::for_latency(20_000, &spec);
        let large = BufferAttr::for_latency(1_729_945, &spec);
        let shared = Arc::new(StreamShared::new(&small));

        let writer = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                for i in 0..50_000 {
                    shared.store_attr(if i % 2 == 0 { &large } else { &small });
                }
            })
        };
        for _ in 0..50_000 {
            let attr = shared.attr(small.fragsize);
            assert!(attr == small || attr == large, "torn read: {:?}", attr);
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_drain_waits_for_prebuffer() {
        let (mut producer, mut drain) = drain(2, 44_100);
        let mut out = [1.0f32; 64];

        // 1000 bytes < 1764 byte prebuffer threshold
        push_samples(&mut producer, &[8192; 500]);
        let outcome = drain.drain(&mut out);
        assert!(!outcome.underflow);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(drain.consumer.occupied_len(), 1000);
        assert_eq!(outcome.request, Some(764));
        assert_eq!(drain.shared.requested.load(Ordering::Acquire), 764);
    }

    #[test]
    fn test_drain_copies_mono_to_every_channel() {
        let (mut producer, mut drain) = drain(2, 44_100);
        let samples: Vec<i16> = (0..882).map(|i| (i * 16) as i16).collect();
        push_samples(&mut producer, &samples);

        let mut out = [0.0f32; 8];
        let outcome = drain.drain(&mut out);
        assert!(!outcome.underflow);
        for (frame, expected) in out.chunks(2).zip(&samples) {
            let value = *expected as f32 / 32768.0;
            assert_eq!(frame, [value, value]);
        }
        assert_eq!(drain.consumer.occupied_len(), 1764 - 8);
    }

    #[test]
    fn test_drain_reports_one_underflow_per_dry_episode() {
        let (mut producer, mut drain) = drain(2, 44_100);
        let (tx, rx) = crossbeam_channel::bounded(8);
        push_samples(&mut producer, &[1000; 882]);

        // 882 frames buffered, 1000 wanted
        let mut out = vec![0.0f32; 2000];
        let outcome = drain.render(&mut out, &tx);
        assert!(outcome.underflow);
        assert!(out[1764..].iter().all(|&s| s == 0.0));
        assert_eq!(rx.try_recv(), Ok(ServerEvent::Underflow));

        // Still dry: prebuffering again, silence without a second underflow
        let outcome = drain.render(&mut out, &tx);
        assert!(!outcome.underflow);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(rx.try_iter().all(|e| e != ServerEvent::Underflow));

        // Refilled to the threshold: playback resumes
        push_samples(&mut producer, &[1000; 882]);
        let outcome = drain.render(&mut out[..64], &tx);
        assert!(!outcome.underflow);
        assert!(out[..64].iter().all(|&s| s != 0.0));
    }

    #[test]
    fn test_drain_requests_only_what_is_missing() {
        let (mut producer, mut drain) = drain(1, 44_100);
        push_samples(&mut producer, &[0; 882]);
        drain.shared.requested.store(0, Ordering::Release);

        let mut out = [0.0f32; 441];
        let outcome = drain.drain(&mut out);
        assert_eq!(outcome.request, Some(882));

        // Outstanding request already covers the gap
        let outcome = drain.drain(&mut [0.0f32; 0]);
        assert_eq!(outcome.request, None);
    }

    #[test]
    fn test_render_settles_request_the_loop_never_sees() {
        let (mut producer, mut drain) = drain(1, 44_100);
        let (tx, rx) = crossbeam_channel::bounded(1);
        tx.send(ServerEvent::Wakeup).unwrap();
        push_samples(&mut producer, &[0; 882]);

        let outcome = drain.render(&mut [0.0f32; 441], &tx);
        assert_eq!(outcome.request, Some(882));
        assert_eq!(drain.shared.requested.load(Ordering::Acquire), 0);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_drain_resamples_to_device_rate() {
        // Device runs at twice the client rate: every client frame is held twice
        let (mut producer, mut drain) = drain(1, 88_200);
        let samples: Vec<i16> = (1..=882).map(|i| i as i16).collect();
        push_samples(&mut producer, &samples);

        let mut out = [0.0f32; 8];
        drain.drain(&mut out);
        let expected: Vec<f32> = [1, 1, 2, 2, 3, 3, 4, 4]
            .iter()
            .map(|&s| s as f32 / 32768.0)
            .collect();
        assert_eq!(out.to_vec(), expected);
        assert_eq!(drain.consumer.occupied_len(), 1764 - 8);
    }

    #[test]
    fn test_drain_decodes_float_frames() {
        let spec = SampleSpec::new(48_000, 2, SampleFormat::Float32le);
        let attr = BufferAttr::for_latency(20_000, &spec);
        let (mut producer, consumer) = HeapRb::<u8>::new(16_384).split();
        let shared = Arc::new(StreamShared::new(&attr));
        let mut drain = RingDrain::new(consumer, shared, spec, 2, 48_000);

        for frame in 0..960 {
            let value = frame as f32 / 1000.0;
            producer.push_slice(&value.to_le_bytes());
            producer.push_slice(&(-value).to_le_bytes());
        }
        let mut out = [0.0f32; 4];
        drain.drain(&mut out);
        assert_eq!(out, [0.0, -0.0, 0.001, -0.001]);
    }

    #[test]
    fn test_unwritten_part_of_request_is_released() {
        let spec = SampleSpec::default();
        let (producer, consumer) = HeapRb::<u8>::new(4096).split();
        let attr = BufferAttr::for_latency(20_000, &spec);
        let stream = CpalStream {
            name: "Playback".into(),
            spec,
            attr,
            producer,
            consumer: Some(consumer),
            ring_capacity: 4096,
            shared: Arc::new(StreamShared::new(&attr)),
            bytes_written: 1000,
            stream: None,
        };
        stream.shared.requested.store(1764, Ordering::Release);

        // Nothing written since the request arrived
        stream.release_unwritten(1764, 1000);
        assert_eq!(stream.shared.requested.load(Ordering::Acquire), 0);
    }
}
