//! Playback configuration
//!
//! Stores the server to connect to, the stream's sample spec, the waveform
//! and the latency policy in a JSON file. Every field has a default, so a
//! partial file (or `{}`) is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::audio::format::{SampleFormat, SampleSpec};
use crate::audio::latency::LatencyPolicy;
use crate::audio::signal::Waveform;
use crate::error::{PlaybackError, Result};

fn default_client_name() -> String {
    "pulseloop".to_string()
}

fn default_stream_name() -> String {
    "Playback".to_string()
}

fn default_sample_rate() -> u32 {
    crate::DEFAULT_SAMPLE_RATE
}

fn default_channels() -> u16 {
    1
}

fn default_buffer_samples() -> usize {
    crate::DEFAULT_BUFFER_SAMPLES
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

/// Playback configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Server (or output device) name; None selects the default
    #[serde(default)]
    pub server: Option<String>,
    /// Client name announced to the server
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Name of the playback stream
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    /// Sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Channel count
    #[serde(default = "default_channels")]
    pub channels: u16,
    /// Sample format
    #[serde(default)]
    pub format: SampleFormat,
    /// Sample buffer capacity in samples
    #[serde(default = "default_buffer_samples")]
    pub buffer_samples: usize,
    /// Generated waveform
    #[serde(default)]
    pub waveform: Waveform,
    /// Latency growth policy
    #[serde(default)]
    pub latency: LatencyPolicy,
    /// Bound on the wait for a ready context
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            server: None,
            client_name: default_client_name(),
            stream_name: default_stream_name(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            format: SampleFormat::default(),
            buffer_samples: default_buffer_samples(),
            waveform: Waveform::default(),
            latency: LatencyPolicy::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl PlaybackConfig {
    /// Sample spec of the playback stream
    pub fn spec(&self) -> SampleSpec {
        SampleSpec::new(self.sample_rate, self.channels, self.format)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Check that a session can be built from this configuration
    pub fn validate(&self) -> Result<()> {
        let spec = self.spec();
        if !spec.is_valid() {
            return Err(PlaybackError::InvalidConfig(format!(
                "unsupported sample spec: {} Hz, {} channels",
                self.sample_rate, self.channels
            )));
        }
        if self.buffer_samples < self.channels as usize {
            return Err(PlaybackError::InvalidConfig(format!(
                "buffer of {} samples cannot hold one frame",
                self.buffer_samples
            )));
        }
        match self.waveform {
            Waveform::Square { period, .. } if period < 2 => {
                return Err(PlaybackError::InvalidConfig(format!(
                    "square wave period {} is shorter than 2 frames",
                    period
                )));
            }
            waveform if !(0.0..=1.0).contains(&waveform.amplitude()) => {
                return Err(PlaybackError::InvalidConfig(format!(
                    "amplitude {} outside full scale",
                    waveform.amplitude()
                )));
            }
            _ => {}
        }
        if !self.latency.is_valid() {
            return Err(PlaybackError::InvalidConfig(format!(
                "latency policy cannot grow: {:?}",
                self.latency
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(PlaybackError::InvalidConfig(
                "connect timeout must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        tracing::info!(path = %path.display(), "Loaded config from disk");
        Ok(config)
    }

    /// Load a configuration file, falling back to defaults on any error
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(PlaybackError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                Self::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Save as pretty JSON, creating parent directories if needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PlaybackConfig::default();
        assert_eq!(config.server, None);
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.channels, 1);
        assert_eq!(config.format, SampleFormat::S16le);
        assert_eq!(config.buffer_samples, 300_000);
        assert_eq!(config.latency.initial_usec, 20_000);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: PlaybackConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, PlaybackConfig::default());
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let json = r#"{"server": "studio", "latency": {"initial_usec": 50000}}"#;
        let config: PlaybackConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.server.as_deref(), Some("studio"));
        assert_eq!(config.latency.initial_usec, 50_000);
        assert_eq!(config.latency.threshold, 6);
        assert_eq!(config.latency.max_usec, 2_000_000);
        assert_eq!(config.client_name, "pulseloop");
    }

    #[test]
    fn test_waveform_json() {
        let json = r#"{"format": "float32le", "waveform": {"kind": "square", "period": 100, "amplitude": 0.5}}"#;
        let config: PlaybackConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.format, SampleFormat::Float32le);
        assert_eq!(
            config.waveform,
            Waveform::Square {
                period: 100,
                amplitude: 0.5
            }
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_rate = PlaybackConfig {
            sample_rate: 0,
            ..Default::default()
        };
        assert!(matches!(
            zero_rate.validate(),
            Err(PlaybackError::InvalidConfig(_))
        ));

        let short_square = PlaybackConfig {
            waveform: Waveform::Square {
                period: 1,
                amplitude: 0.5,
            },
            ..Default::default()
        };
        assert!(short_square.validate().is_err());

        let loud = PlaybackConfig {
            waveform: Waveform::Cosine {
                angular_frequency: 5000.0,
                amplitude: 1.5,
            },
            ..Default::default()
        };
        assert!(loud.validate().is_err());

        let tiny_buffer = PlaybackConfig {
            channels: 2,
            buffer_samples: 1,
            ..Default::default()
        };
        assert!(tiny_buffer.validate().is_err());

        let no_timeout = PlaybackConfig {
            connect_timeout_ms: 0,
            ..Default::default()
        };
        assert!(no_timeout.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = PlaybackConfig {
            server: Some("null".into()),
            sample_rate: 48000,
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = PlaybackConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_default_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            PlaybackConfig::load(&path),
            Err(PlaybackError::Json(_))
        ));
        assert_eq!(
            PlaybackConfig::load_or_default(&path),
            PlaybackConfig::default()
        );
        assert_eq!(
            PlaybackConfig::load_or_default(&dir.path().join("missing.json")),
            PlaybackConfig::default()
        );
    }
}
