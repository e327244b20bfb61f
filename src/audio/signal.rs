//! Precomputed periodic test signal
//!
//! The whole signal is generated once, encoded in the stream's sample
//! format, and never resized afterwards. Playback reads it through a
//! [`SampleRing`](crate::audio::ring::SampleRing).

use serde::{Deserialize, Serialize};

use crate::audio::format::SampleSpec;

/// Closed-form periodic waveform
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Waveform {
    /// `amplitude * cos(angular_frequency * n / rate)` for frame `n`
    Cosine {
        /// Angular frequency in radians per second
        angular_frequency: f64,
        /// Peak amplitude as a fraction of full scale
        amplitude: f64,
    },
    /// 50% duty cycle square wave alternating between `+amplitude` and `-amplitude`
    Square {
        /// Period length in frames (at least 2)
        period: usize,
        /// Peak amplitude as a fraction of full scale
        amplitude: f64,
    },
}

impl Waveform {
    /// Normalized value of frame `n`
    pub fn value_at(&self, n: usize, rate: u32) -> f64 {
        match *self {
            Self::Cosine {
                angular_frequency,
                amplitude,
            } => amplitude * (angular_frequency * n as f64 / rate as f64).cos(),
            Self::Square { period, amplitude } => {
                if n % period < period / 2 {
                    amplitude
                } else {
                    -amplitude
                }
            }
        }
    }

    /// Peak amplitude
    pub fn amplitude(&self) -> f64 {
        match *self {
            Self::Cosine { amplitude, .. } | Self::Square { amplitude, .. } => amplitude,
        }
    }
}

impl Default for Waveform {
    fn default() -> Self {
        // 5000 rad/s at 32000/32768 of full scale
        Self::Cosine {
            angular_frequency: 5000.0,
            amplitude: 0.976_562_5,
        }
    }
}

/// Fixed-capacity buffer of encoded samples
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    /// Encoded sample bytes, interleaved by channel
    data: Vec<u8>,
    /// Spec the bytes are encoded in
    spec: SampleSpec,
    /// Capacity in samples (a whole number of frames)
    capacity: usize,
}

impl SampleBuffer {
    /// Generate `capacity` samples of `waveform` encoded for `spec`
    ///
    /// Every channel of a frame carries the same value. The capacity is
    /// rounded down to whole frames. Output is a pure function of the
    /// arguments.
    ///
    /// # Panics
    /// Panics if `capacity` is smaller than one frame or a square wave has
    /// a period below 2 frames
    ///
    /// # Example
    /// ```
    /// use pulseloop::{SampleBuffer, SampleSpec, Waveform};
    ///
    /// let buffer = SampleBuffer::generate(Waveform::default(), SampleSpec::default(), 1024);
    /// assert_eq!(buffer.capacity(), 1024);
    /// assert_eq!(buffer.byte_len(), 2048);
    /// ```
    pub fn generate(waveform: Waveform, spec: SampleSpec, capacity: usize) -> Self {
        let channels = spec.channels as usize;
        assert!(capacity >= channels, "Capacity must hold at least one frame");
        if let Waveform::Square { period, .. } = waveform {
            assert!(period >= 2, "Square wave period must be at least 2 frames");
        }

        let frames = capacity / channels;
        let sample_size = spec.sample_size();
        let mut data = vec![0u8; frames * spec.frame_size()];

        for (n, frame) in data.chunks_exact_mut(spec.frame_size()).enumerate() {
            let value = waveform.value_at(n, spec.rate);
            for sample in frame.chunks_exact_mut(sample_size) {
                spec.format.encode(value, sample);
            }
        }

        Self {
            data,
            spec,
            capacity: frames * channels,
        }
    }

    /// Capacity in samples
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Capacity in bytes
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Size of one sample in bytes
    pub fn sample_size(&self) -> usize {
        self.spec.sample_size()
    }

    /// Spec the samples are encoded in
    pub fn spec(&self) -> &SampleSpec {
        &self.spec
    }

    /// Raw encoded bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Decoded value of sample `index`, or None past the end
    pub fn sample(&self, index: usize) -> Option<f32> {
        let size = self.sample_size();
        let start = index.checked_mul(size)?;
        let bytes = self.data.get(start..start + size)?;
        Some(self.spec.format.decode(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::SampleFormat;
    use approx::assert_abs_diff_eq;

    fn raw_i16(buffer: &SampleBuffer, index: usize) -> i16 {
        let bytes = &buffer.as_bytes()[index * 2..index * 2 + 2];
        i16::from_le_bytes([bytes[0], bytes[1]])
    }

    #[test]
    fn test_reference_tone_values() {
        let buffer = SampleBuffer::generate(Waveform::default(), SampleSpec::default(), 300_000);
        assert_eq!(buffer.capacity(), 300_000);
        assert_eq!(buffer.byte_len(), 600_000);

        for i in [0usize, 1, 7, 1000, 299_999] {
            let expected = (32000.0 * (5000.0 * i as f64 / 44100.0).cos()).round() as i16;
            assert_eq!(raw_i16(&buffer, i), expected, "sample {}", i);
        }
        assert_eq!(raw_i16(&buffer, 0), 32000);
    }

    #[test]
    fn test_generate_is_deterministic() {
        let a = SampleBuffer::generate(Waveform::default(), SampleSpec::default(), 4096);
        let b = SampleBuffer::generate(Waveform::default(), SampleSpec::default(), 4096);
        assert_eq!(a, b);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_square_wave_duty_cycle() {
        let wave = Waveform::Square {
            period: 8,
            amplitude: 0.5,
        };
        let spec = SampleSpec::new(44100, 1, SampleFormat::Float32le);
        let buffer = SampleBuffer::generate(wave, spec, 16);

        let values: Vec<f32> = (0..16).map(|i| buffer.sample(i).unwrap()).collect();
        assert_eq!(&values[0..4], &[0.5; 4]);
        assert_eq!(&values[4..8], &[-0.5; 4]);
        assert_eq!(&values[8..12], &[0.5; 4]);
        assert_eq!(&values[12..16], &[-0.5; 4]);
    }

    #[test]
    fn test_channels_share_frame_value() {
        let spec = SampleSpec::new(48000, 2, SampleFormat::Float32le);
        let buffer = SampleBuffer::generate(Waveform::default(), spec, 101);

        // Rounded down to whole frames
        assert_eq!(buffer.capacity(), 100);
        for frame in 0..50 {
            assert_eq!(buffer.sample(frame * 2), buffer.sample(frame * 2 + 1));
        }
    }

    #[test]
    fn test_float_tone_tracks_cosine() {
        let spec = SampleSpec::new(44100, 1, SampleFormat::Float32le);
        let buffer = SampleBuffer::generate(Waveform::default(), spec, 512);
        for i in 0..512 {
            let expected = 0.976_562_5 * (5000.0 * i as f64 / 44100.0).cos();
            assert_abs_diff_eq!(buffer.sample(i).unwrap() as f64, expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_sample_out_of_range() {
        let buffer = SampleBuffer::generate(Waveform::default(), SampleSpec::default(), 8);
        assert!(buffer.sample(7).is_some());
        assert!(buffer.sample(8).is_none());
    }

    #[test]
    #[should_panic]
    fn test_square_period_too_short() {
        let wave = Waveform::Square {
            period: 1,
            amplitude: 0.5,
        };
        SampleBuffer::generate(wave, SampleSpec::default(), 16);
    }

    #[test]
    #[should_panic]
    fn test_capacity_below_one_frame() {
        let spec = SampleSpec::new(44100, 2, SampleFormat::S16le);
        SampleBuffer::generate(Waveform::default(), spec, 1);
    }
}
