//! Sample specification and byte/time conversions
//!
//! Every byte count handed to or received from the audio server is relative
//! to a [`SampleSpec`]. Conversions round down to whole frames, matching the
//! server's own arithmetic.

use serde::{Deserialize, Serialize};

/// Microseconds per second
pub const USEC_PER_SEC: u64 = 1_000_000;

/// Wire format of a single sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Signed 16-bit little endian
    #[default]
    S16le,
    /// 32-bit IEEE float little endian
    Float32le,
}

impl SampleFormat {
    /// Size of one sample in bytes
    pub fn sample_size(self) -> usize {
        match self {
            Self::S16le => 2,
            Self::Float32le => 4,
        }
    }

    /// Parse a format name as used on the command line
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "s16le" | "s16" => Some(Self::S16le),
            "float32le" | "f32" | "float32" => Some(Self::Float32le),
            _ => None,
        }
    }

    /// Encode a normalized sample (-1.0..=1.0) into `out`
    ///
    /// `out` must be exactly [`sample_size`](Self::sample_size) bytes long.
    pub fn encode(self, value: f64, out: &mut [u8]) {
        match self {
            Self::S16le => {
                let scaled = (value * 32768.0).round().clamp(i16::MIN as f64, i16::MAX as f64);
                out.copy_from_slice(&(scaled as i16).to_le_bytes());
            }
            Self::Float32le => {
                out.copy_from_slice(&(value as f32).to_le_bytes());
            }
        }
    }

    /// Decode one sample from `bytes` into a normalized f32
    pub fn decode(self, bytes: &[u8]) -> f32 {
        match self {
            Self::S16le => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32768.0,
            Self::Float32le => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }
}

/// Immutable stream sample specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleSpec {
    /// Sample rate in Hz
    pub rate: u32,
    /// Interleaved channel count
    pub channels: u16,
    /// Sample format
    pub format: SampleFormat,
}

impl SampleSpec {
    pub fn new(rate: u32, channels: u16, format: SampleFormat) -> Self {
        Self {
            rate,
            channels,
            format,
        }
    }

    /// Whether rate and channel count are usable
    pub fn is_valid(&self) -> bool {
        (1..=384_000).contains(&self.rate) && (1..=32).contains(&self.channels)
    }

    /// Size of one sample in bytes
    pub fn sample_size(&self) -> usize {
        self.format.sample_size()
    }

    /// Size of one frame (one sample per channel) in bytes
    pub fn frame_size(&self) -> usize {
        self.sample_size() * self.channels as usize
    }

    /// Bytes of audio covering `usec` microseconds, rounded down to whole frames
    pub fn usec_to_bytes(&self, usec: u64) -> usize {
        let frames = usec * self.rate as u64 / USEC_PER_SEC;
        frames as usize * self.frame_size()
    }

    /// Playback time of `bytes` in microseconds, ignoring any partial frame
    pub fn bytes_to_usec(&self, bytes: usize) -> u64 {
        let frames = (bytes / self.frame_size()) as u64;
        frames * USEC_PER_SEC / self.rate as u64
    }
}

impl Default for SampleSpec {
    fn default() -> Self {
        Self::new(crate::DEFAULT_SAMPLE_RATE, 1, SampleFormat::S16le)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        let mono = SampleSpec::new(44100, 1, SampleFormat::S16le);
        assert_eq!(mono.sample_size(), 2);
        assert_eq!(mono.frame_size(), 2);

        let stereo = SampleSpec::new(48000, 2, SampleFormat::Float32le);
        assert_eq!(stereo.sample_size(), 4);
        assert_eq!(stereo.frame_size(), 8);
    }

    #[test]
    fn test_usec_to_bytes_reference_latency() {
        let spec = SampleSpec::default();
        // 20ms at 44.1kHz mono s16 = 882 frames
        assert_eq!(spec.usec_to_bytes(20_000), 1764);
        assert_eq!(spec.usec_to_bytes(30_000), 2646);
        assert_eq!(spec.usec_to_bytes(0), 0);
    }

    #[test]
    fn test_usec_to_bytes_rounds_down_to_frames() {
        let spec = SampleSpec::new(44100, 2, SampleFormat::S16le);
        // 10us = 0.441 frames -> 0
        assert_eq!(spec.usec_to_bytes(10), 0);
        // 100us = 4.41 frames -> 4 frames of 4 bytes
        assert_eq!(spec.usec_to_bytes(100), 16);
    }

    #[test]
    fn test_bytes_to_usec() {
        let spec = SampleSpec::default();
        assert_eq!(spec.bytes_to_usec(88200), 1_000_000);
        // Trailing odd byte is not a whole frame
        assert_eq!(spec.bytes_to_usec(88201), 1_000_000);
    }

    #[test]
    fn test_s16_encode_clamps_and_rounds() {
        let mut out = [0u8; 2];
        SampleFormat::S16le.encode(1.0, &mut out);
        assert_eq!(i16::from_le_bytes(out), i16::MAX);

        SampleFormat::S16le.encode(-1.0, &mut out);
        assert_eq!(i16::from_le_bytes(out), i16::MIN);

        SampleFormat::S16le.encode(32000.0 / 32768.0, &mut out);
        assert_eq!(i16::from_le_bytes(out), 32000);
    }

    #[test]
    fn test_decode_matches_encode() {
        let mut out = [0u8; 4];
        SampleFormat::Float32le.encode(0.25, &mut out);
        assert_eq!(SampleFormat::Float32le.decode(&out), 0.25);

        let mut out = [0u8; 2];
        SampleFormat::S16le.encode(0.5, &mut out);
        assert_eq!(SampleFormat::S16le.decode(&out), 0.5);
    }

    #[test]
    fn test_format_names() {
        assert_eq!(SampleFormat::from_name("s16le"), Some(SampleFormat::S16le));
        assert_eq!(SampleFormat::from_name("F32"), Some(SampleFormat::Float32le));
        assert_eq!(SampleFormat::from_name("u8"), None);
    }

    #[test]
    fn test_spec_validity() {
        assert!(SampleSpec::default().is_valid());
        assert!(!SampleSpec::new(0, 1, SampleFormat::S16le).is_valid());
        assert!(!SampleSpec::new(44100, 0, SampleFormat::S16le).is_valid());
    }
}
