//! Ring reader over a precomputed sample buffer
//!
//! Reads never split across the end of the buffer: a read that would cross
//! it restarts at offset 0 instead. This leaves an audible discontinuity at
//! the wrap point but keeps every write a single contiguous slice.

use std::sync::Arc;

use crate::audio::signal::SampleBuffer;

/// Read cursor over a shared, read-only [`SampleBuffer`]
///
/// Invariant: `0 <= cursor < capacity` (in samples).
#[derive(Debug, Clone)]
pub struct SampleRing {
    buffer: Arc<SampleBuffer>,
    cursor: usize,
    wraps: u64,
}

impl SampleRing {
    pub fn new(buffer: Arc<SampleBuffer>) -> Self {
        Self {
            buffer,
            cursor: 0,
            wraps: 0,
        }
    }

    /// Current read position in samples
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Number of times the cursor restarted at 0 before a read
    pub fn wraps(&self) -> u64 {
        self.wraps
    }

    /// Total buffer size in bytes; reads are clamped to this
    pub fn byte_capacity(&self) -> usize {
        self.buffer.byte_len()
    }

    /// Underlying sample buffer
    pub fn buffer(&self) -> &Arc<SampleBuffer> {
        &self.buffer
    }

    /// Whether reading `len` bytes from the current cursor would cross the end
    pub fn would_wrap(&self, len: usize) -> bool {
        self.cursor * self.buffer.sample_size() + len > self.buffer.byte_len()
    }

    /// Read up to `len` bytes and advance the cursor by `len / sample_size`
    ///
    /// `len` is clamped to the buffer's byte capacity. If the read would
    /// cross the end of the buffer, the cursor restarts at 0 first.
    pub fn read(&mut self, len: usize) -> &[u8] {
        let len = len.min(self.buffer.byte_len());
        let sample_size = self.buffer.sample_size();

        if self.would_wrap(len) {
            self.cursor = 0;
            self.wraps += 1;
        }

        let start = self.cursor * sample_size;
        self.cursor += len / sample_size;
        if self.cursor >= self.buffer.capacity() {
            self.cursor = 0;
        }

        &self.buffer.as_bytes()[start..start + len]
    }
}
