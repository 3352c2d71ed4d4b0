/// Audio buffer module for storing rolling audio data
///
/// Implements a ring buffer addressed by absolute sample position. The session
/// appends variable-sized chunks and reads fixed-length windows back out by
/// position; samples behind the read cursor are released as the window slides.
/// Sized by default to hold 3 seconds of 16kHz PCM audio (~96KB).

use crate::audio::{AudioSample, SAMPLE_RATE};
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use thiserror::Error;
use tracing::{trace, warn};

/// Ring buffer size: 3 seconds at 16kHz sample rate
pub const BUFFER_DURATION_SECS: usize = 3;
pub const BUFFER_SIZE: usize = BUFFER_DURATION_SECS * SAMPLE_RATE as usize; // 48,000 samples

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AudioBufferError {
    #[error("Insufficient data: window ends at sample {requested}, but only {available} samples written")]
    InsufficientData { requested: u64, available: u64 },

    #[error("Window start {start} was overwritten (oldest retained sample is {oldest})")]
    Evicted { start: u64, oldest: u64 },

    #[error("Invalid buffer size: {0}")]
    InvalidSize(usize),
}

/// Result of a single append
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Samples stored
    pub written: usize,
    /// Unread samples lost to make room (non-zero means overrun)
    pub overwritten: usize,
}

impl AppendOutcome {
    pub fn overrun(&self) -> bool {
        self.overwritten > 0
    }
}

/// Read-only view of a window inside the ring.
///
/// The window may straddle the wrap point, so it is kept as two slices.
#[derive(Debug, Clone, Copy)]
pub struct Window<'a> {
    start: u64,
    head: &'a [AudioSample],
    tail: &'a [AudioSample],
}

impl<'a> Window<'a> {
    /// Absolute position of the first sample
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Absolute position one past the last sample
    pub fn end(&self) -> u64 {
        self.start + self.len() as u64
    }

    pub fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a AudioSample> + 'a {
        self.head.iter().chain(self.tail.iter())
    }

    /// Copy the window into contiguous storage
    pub fn to_vec(&self) -> Vec<AudioSample> {
        let mut samples = Vec::with_capacity(self.len());
        samples.extend_from_slice(self.head);
        samples.extend_from_slice(self.tail);
        samples
    }
}

/// Ring buffer for audio samples owned by a single session
pub struct AudioBuffer {
    ring: HeapRb<AudioSample>,
    /// Samples ever appended, including ones dropped before storage
    total_written: u64,
    /// Absolute position of the first sample not yet released
    read_pos: u64,
    overruns: u64,
}

impl AudioBuffer {
    /// Create a new audio buffer with default 3-second capacity
    pub fn new() -> Self {
        Self {
            ring: HeapRb::new(BUFFER_SIZE),
            total_written: 0,
            read_pos: 0,
            overruns: 0,
        }
    }

    /// Create a buffer with custom capacity
    pub fn with_capacity(capacity: usize) -> Result<Self, AudioBufferError> {
        if capacity == 0 {
            return Err(AudioBufferError::InvalidSize(capacity));
        }

        trace!("Creating audio buffer with capacity: {} samples", capacity);

        Ok(Self {
            ring: HeapRb::new(capacity),
            total_written: 0,
            read_pos: 0,
            overruns: 0,
        })
    }

    /// Append samples to the buffer.
    ///
    /// If the unread region would exceed capacity, the oldest unread samples
    /// are overwritten and the outcome reports how many were lost.
    pub fn append(&mut self, samples: &[AudioSample]) -> AppendOutcome {
        // Samples behind the read cursor were released before they arrived
        let behind = self
            .read_pos
            .saturating_sub(self.total_written)
            .min(samples.len() as u64) as usize;
        self.total_written += behind as u64;
        let samples = &samples[behind..];

        let capacity = self.capacity();
        let vacant = self.ring.vacant_len();
        let mut outcome = AppendOutcome {
            written: samples.len().min(capacity),
            overwritten: 0,
        };

        if samples.len() > vacant {
            outcome.overwritten = samples.len() - vacant;

            if samples.len() >= capacity {
                self.ring.clear();
                self.ring.push_slice(&samples[samples.len() - capacity..]);
            } else {
                self.ring.skip(outcome.overwritten);
                self.ring.push_slice(samples);
            }

            self.overruns += 1;
            warn!(
                "Buffer overrun: {} unread samples overwritten",
                outcome.overwritten
            );
        } else {
            self.ring.push_slice(samples);
        }

        self.total_written += samples.len() as u64;
        self.read_pos = self.read_pos.max(self.oldest_position());

        outcome
    }

    /// View `length` samples starting at absolute position `start`
    pub fn window(&self, start: u64, length: usize) -> Result<Window<'_>, AudioBufferError> {
        let end = start + length as u64;
        if end > self.total_written {
            return Err(AudioBufferError::InsufficientData {
                requested: end,
                available: self.total_written,
            });
        }

        let oldest = self.oldest_position();
        if start < oldest {
            return Err(AudioBufferError::Evicted { start, oldest });
        }

        let offset = (start - oldest) as usize;
        let (first, second) = self.ring.as_slices();

        let (head, tail): (&[AudioSample], &[AudioSample]) = if offset >= first.len() {
            let at = offset - first.len();
            (&second[at..at + length], &[])
        } else if offset + length <= first.len() {
            (&first[offset..offset + length], &[])
        } else {
            (&first[offset..], &second[..offset + length - first.len()])
        };

        Ok(Window { start, head, tail })
    }

    /// Release every sample before absolute position `position`
    pub fn release(&mut self, position: u64) {
        let releasable = position.saturating_sub(self.oldest_position());
        let to_skip = releasable.min(self.ring.occupied_len() as u64) as usize;
        self.ring.skip(to_skip);
        self.read_pos = self.read_pos.max(position);
    }

    /// Absolute position of the oldest sample still stored
    pub fn oldest_position(&self) -> u64 {
        self.total_written - self.ring.occupied_len() as u64
    }

    /// Absolute position of the first unreleased sample
    pub fn read_position(&self) -> u64 {
        self.read_pos
    }

    /// Total samples appended since creation
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Get the number of samples currently in the buffer
    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Get buffer capacity
    pub fn capacity(&self) -> usize {
        self.ring.capacity().get()
    }

    /// Get the amount of free space in the buffer
    pub fn free_space(&self) -> usize {
        self.ring.vacant_len()
    }

    /// Number of appends that overwrote unread samples
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Get duration of audio currently in buffer (in seconds)
    pub fn duration_secs(&self, sample_rate: u32) -> f32 {
        self.len() as f32 / sample_rate as f32
    }
}

impl Default for AudioBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp(start: i16, count: usize) -> Vec<AudioSample> {
        (0..count).map(|i| start + i as i16).collect()
    }

    #[test]
    fn test_buffer_creation() {
        let buffer = AudioBuffer::new();
        assert_eq!(buffer.capacity(), BUFFER_SIZE);
        assert_eq!(buffer.len(), 0);
        assert!(buffer.is_empty());
        assert_eq!(buffer.total_written(), 0);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            AudioBuffer::with_capacity(0),
            Err(AudioBufferError::InvalidSize(0))
        ));
    }

    #[test]
    fn test_append_and_window() {
        let mut buffer = AudioBuffer::with_capacity(1000).unwrap();
        let outcome = buffer.append(&ramp(0, 100));

        assert_eq!(outcome.written, 100);
        assert!(!outcome.overrun());
        assert_eq!(buffer.len(), 100);

        let window = buffer.window(10, 20).unwrap();
        assert_eq!(window.start(), 10);
        assert_eq!(window.end(), 30);
        assert_eq!(window.to_vec(), ramp(10, 20));
    }

    #[test]
    fn test_window_insufficient_data() {
        let mut buffer = AudioBuffer::with_capacity(100).unwrap();
        buffer.append(&ramp(0, 50));

        match buffer.window(0, 80) {
            Err(AudioBufferError::InsufficientData { requested, available }) => {
                assert_eq!(requested, 80);
                assert_eq!(available, 50);
            }
            other => panic!("Expected InsufficientData, got {:?}", other.map(|w| w.len())),
        }
    }

    #[test]
    fn test_window_does_not_consume() {
        let mut buffer = AudioBuffer::with_capacity(100).unwrap();
        buffer.append(&[1, 2, 3, 4, 5]);

        let first = buffer.window(0, 3).unwrap().to_vec();
        let again = buffer.window(0, 3).unwrap().to_vec();

        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(first, again);
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_release_slides_window() {
        let mut buffer = AudioBuffer::with_capacity(100).unwrap();
        buffer.append(&ramp(0, 60));
        buffer.release(20);

        assert_eq!(buffer.len(), 40);
        assert_eq!(buffer.oldest_position(), 20);
        assert_eq!(buffer.read_position(), 20);
        assert!(matches!(
            buffer.window(10, 5),
            Err(AudioBufferError::Evicted { start: 10, oldest: 20 })
        ));
        assert_eq!(buffer.window(20, 5).unwrap().to_vec(), ramp(20, 5));
    }

    #[test]
    fn test_release_ahead_of_data_drops_future_samples() {
        let mut buffer = AudioBuffer::with_capacity(100).unwrap();
        buffer.append(&ramp(0, 10));
        buffer.release(25);

        assert!(buffer.is_empty());

        // Samples 10..25 are behind the cursor and never stored
        buffer.append(&ramp(10, 20));
        assert_eq!(buffer.total_written(), 30);
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.window(25, 5).unwrap().to_vec(), ramp(25, 5));
    }

    #[test]
    fn test_overrun_overwrites_oldest() {
        let mut buffer = AudioBuffer::with_capacity(10).unwrap();
        buffer.append(&ramp(0, 8));

        let outcome = buffer.append(&ramp(8, 5));
        assert!(outcome.overrun());
        assert_eq!(outcome.overwritten, 3);
        assert_eq!(buffer.overruns(), 1);
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.oldest_position(), 3);
        assert_eq!(buffer.read_position(), 3);
        assert_eq!(buffer.window(3, 10).unwrap().to_vec(), ramp(3, 10));
    }

    #[test]
    fn test_append_larger_than_capacity() {
        let mut buffer = AudioBuffer::with_capacity(100).unwrap();
        let outcome = buffer.append(&ramp(0, 150));

        assert_eq!(outcome.written, 100);
        assert_eq!(outcome.overwritten, 50);
        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.window(50, 100).unwrap().to_vec(), ramp(50, 100));
    }

    #[test]
    fn test_window_across_wrap_point() {
        let mut buffer = AudioBuffer::with_capacity(10).unwrap();
        buffer.append(&ramp(0, 8));
        buffer.release(6);
        buffer.append(&ramp(8, 6));

        let window = buffer.window(6, 8).unwrap();
        assert_eq!(window.len(), 8);
        assert_eq!(window.iter().copied().collect::<Vec<_>>(), ramp(6, 8));
    }

    #[test]
    fn test_free_space() {
        let mut buffer = AudioBuffer::with_capacity(100).unwrap();
        assert_eq!(buffer.free_space(), 100);

        buffer.append(&vec![1; 30]);
        assert_eq!(buffer.free_space(), 70);

        buffer.release(10);
        assert_eq!(buffer.free_space(), 80);
    }

    #[test]
    fn test_duration_calculation() {
        let mut buffer = AudioBuffer::new();
        buffer.append(&vec![0; SAMPLE_RATE as usize]);

        assert_relative_eq!(buffer.duration_secs(SAMPLE_RATE), 1.0, epsilon = 0.01);
    }
}
