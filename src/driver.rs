//! Event loop driver
//!
//! Pumps an [`AudioServer`]'s event loop on behalf of a [`PlaybackSession`]:
//!
//! 1. Connect and poll the context state after every pump until it is
//!    ready, has failed, the connect timeout expires or shutdown is requested
//! 2. Create the playback stream and connect it to the default sink
//! 3. Pump with blocking waits until shutdown or context failure
//!
//! The context is disconnected on every exit path, including setup errors
//! that happen before a stream exists.

use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::config::PlaybackConfig;
use crate::error::{PlaybackError, Result};
use crate::server::cpal_backend::CpalServer;
use crate::server::simulated::SimulatedServer;
use crate::server::{AudioServer, ContextState, MainloopWaker, StreamFlags};
use crate::session::{PlaybackSession, PlaybackSummary};

/// Upper bound on a single pump while waiting for the context
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Requests the event loop to stop from any thread
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    cancelled: Arc<AtomicBool>,
    waker: MainloopWaker,
}

impl ShutdownHandle {
    fn new(waker: MainloopWaker) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            waker,
        }
    }

    /// Ask the loop to stop and wake it if it is blocked
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.waker.wake();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Drives one connection attempt against an audio server
pub struct EventLoopDriver<S: AudioServer> {
    server: S,
    server_name: Option<String>,
    stream_name: String,
    connect_timeout: Duration,
    shutdown: ShutdownHandle,
}

impl<S: AudioServer> EventLoopDriver<S> {
    pub fn new(server: S, config: &PlaybackConfig) -> Self {
        let shutdown = ShutdownHandle::new(server.waker());
        Self {
            server,
            server_name: config.server.clone(),
            stream_name: config.stream_name.clone(),
            connect_timeout: config.connect_timeout(),
            shutdown,
        }
    }

    /// Handle that stops [`run`](Self::run) from another thread
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn server(&self) -> &S {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut S {
        &mut self.server
    }

    pub fn into_server(self) -> S {
        self.server
    }

    /// Connect, play until shutdown or failure, then tear down
    ///
    /// Returns the session summary when stopped through the shutdown handle.
    /// Setup errors and a context that fails during playback are returned
    /// after teardown.
    pub fn run(&mut self, session: &mut PlaybackSession) -> Result<PlaybackSummary> {
        let result = self.connect_and_play(session);
        if let Err(e) = &result {
            error!("Playback aborted: {}", e);
        }
        self.server.disconnect();
        info!(
            latency_usec = session.latency().current_usec(),
            adjustments = session.latency().adjustments(),
            "Playback loop stopped"
        );
        result.map(|()| session.summary())
    }

    fn connect_and_play(&mut self, session: &mut PlaybackSession) -> Result<()> {
        info!(server = ?self.server_name, "Connecting to audio server");
        self.server.connect(self.server_name.as_deref())?;

        if !self.wait_ready(session)? {
            return Ok(());
        }
        self.setup_stream(session)?;
        self.pump(session)
    }

    /// Pump until the context reaches a terminal state
    ///
    /// Returns false if shutdown was requested before the context was ready.
    pub fn wait_ready(&mut self, session: &mut PlaybackSession) -> Result<bool> {
        let deadline = Instant::now() + self.connect_timeout;
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(false);
            }
            match session.connection_state() {
                ContextState::Ready => return Ok(true),
                state if state.is_failure() => return Err(PlaybackError::ContextFailed(state)),
                _ => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PlaybackError::ConnectTimeout(self.connect_timeout));
            }
            self.server
                .iterate(Some(remaining.min(READY_POLL_INTERVAL)), session)?;
        }
    }

    /// Create the stream and connect it with the session's initial attributes
    pub fn setup_stream(&mut self, session: &PlaybackSession) -> Result<()> {
        let spec = *session.spec();
        let attr = session.buffer_attr();
        self.server.create_stream(&self.stream_name, &spec)?;
        self.server.connect_playback(&attr, StreamFlags::playback())?;
        info!(
            stream = %self.stream_name,
            latency_usec = session.latency().current_usec(),
            tlength = attr.tlength,
            "Playback started"
        );
        Ok(())
    }

    fn pump(&mut self, session: &mut PlaybackSession) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            let state = session.connection_state();
            if state.is_failure() {
                return Err(PlaybackError::ContextFailed(state));
            }
            self.server.iterate(None, session)?;
        }
    }
}

/// Audio server implementation to play through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// System output device
    Cpal,
    /// In-process null sink draining at the sample rate
    Null,
}

impl Backend {
    /// Parse a backend name as used on the command line
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "cpal" | "device" => Some(Self::Cpal),
            "null" | "simulated" => Some(Self::Null),
            _ => None,
        }
    }
}

/// Playback running on a background thread
pub struct PlaybackHandle {
    shutdown: ShutdownHandle,
    thread: JoinHandle<Result<PlaybackSummary>>,
}

impl PlaybackHandle {
    /// Ask the playback thread to stop
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Whether the playback thread has exited
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the playback thread and return its summary
    pub fn join(self) -> Result<PlaybackSummary> {
        self.thread
            .join()
            .map_err(|_| PlaybackError::Thread("playback thread panicked".into()))?
    }
}

/// Start playback on a dedicated thread
///
/// The server is created on the playback thread, so backends that are not
/// `Send` work too. Returns once the loop is about to connect; errors before
/// that point (such as an invalid configuration) are returned directly.
pub fn spawn_playback(config: PlaybackConfig, backend: Backend) -> Result<PlaybackHandle> {
    config.validate()?;
    let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

    let thread = std::thread::Builder::new()
        .name("pulseloop-audio".into())
        .spawn(move || match backend {
            Backend::Cpal => run_on_thread(CpalServer::new(&config.client_name), &config, ready_tx),
            Backend::Null => run_on_thread(SimulatedServer::realtime(), &config, ready_tx),
        })?;

    match ready_rx.recv() {
        Ok(shutdown) => Ok(PlaybackHandle { shutdown, thread }),
        Err(_) => match thread.join() {
            Ok(Err(e)) => Err(e),
            Ok(Ok(_)) => Err(PlaybackError::Thread(
                "playback thread exited before starting".into(),
            )),
            Err(_) => Err(PlaybackError::Thread("playback thread panicked".into())),
        },
    }
}

fn run_on_thread<S: AudioServer>(
    server: S,
    config: &PlaybackConfig,
    ready_tx: Sender<ShutdownHandle>,
) -> Result<PlaybackSummary> {
    let mut session = PlaybackSession::from_config(config)?;
    let mut driver = EventLoopDriver::new(server, config);
    let _ = ready_tx.send(driver.shutdown_handle());
    drop(ready_tx);

    driver.run(&mut session)
}
