//! Error types for connection, stream setup and steady-state playback

use std::time::Duration;
use thiserror::Error;

use crate::server::ContextState;

/// Result type for pulseloop operations
pub type Result<T> = std::result::Result<T, PlaybackError>;

/// Errors that can occur while connecting to the audio server or playing
#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Context entered terminal state {0:?}")]
    ContextFailed(ContextState),

    #[error("Server not ready after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Failed to create stream: {0}")]
    StreamCreation(String),

    #[error("Stream write failed: {0}")]
    Write(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Audio thread error: {0}")]
    Thread(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PlaybackError {
    /// Whether this error belongs to the connection phase
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::ContextFailed(_) | Self::ConnectTimeout(_)
        )
    }
}
