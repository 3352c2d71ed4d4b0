/// Audio format and chunk types
///
/// Everything the pipeline sees is 16-bit little-endian PCM. Chunks carry
/// their declared format so a session can reject a stream that drifts away
/// from what the models were trained on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

/// Sample rate every bundled model expects
pub const SAMPLE_RATE: u32 = 16000;

/// Bit depth every bundled model expects
pub const BIT_DEPTH: u16 = 16;

/// Audio format specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bit_depth: u16,
    pub channels: u16,
}

impl AudioFormat {
    /// Create a new audio format
    pub fn new(sample_rate: u32, bit_depth: u16, channels: u16) -> Self {
        Self {
            sample_rate,
            bit_depth,
            channels,
        }
    }

    /// Mono 16-bit PCM at the given rate
    pub fn mono_pcm16(sample_rate: u32) -> Self {
        Self::new(sample_rate, BIT_DEPTH, 1)
    }

    /// Convert a sample count to milliseconds of audio
    pub fn samples_to_millis(&self, samples: u64) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        samples * 1000 / self.sample_rate as u64
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::mono_pcm16(SAMPLE_RATE)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz/{}bit/{}ch",
            self.sample_rate, self.bit_depth, self.channels
        )
    }
}

/// A chunk of raw PCM bytes as received from a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub format: AudioFormat,
    pub bytes: Vec<u8>,
    /// Client-supplied timestamp in milliseconds, if any
    pub timestamp: Option<u64>,
}

impl AudioChunk {
    pub fn new(format: AudioFormat, bytes: Vec<u8>, timestamp: Option<u64>) -> Self {
        Self {
            format,
            bytes,
            timestamp,
        }
    }

    /// Build a chunk from samples (mostly useful for tests and WAV replay)
    pub fn from_samples(format: AudioFormat, samples: &[AudioSample], timestamp: Option<u64>) -> Self {
        Self::new(format, samples_to_bytes(samples), timestamp)
    }
}

/// Decode little-endian PCM16 into samples.
///
/// `carry` holds a dangling byte from the previous chunk; it is consumed first
/// and refilled if this chunk also ends mid-sample.
pub fn decode_pcm16(bytes: &[u8], carry: &mut Option<u8>) -> Vec<AudioSample> {
    let mut samples = Vec::with_capacity((bytes.len() + 1) / 2);
    let mut rest = bytes;

    if let Some(low) = carry.take() {
        match rest.split_first() {
            Some((&high, tail)) => {
                samples.push(i16::from_le_bytes([low, high]));
                rest = tail;
            }
            None => {
                *carry = Some(low);
                return samples;
            }
        }
    }

    let mut pairs = rest.chunks_exact(2);
    samples.extend(pairs.by_ref().map(|p| i16::from_le_bytes([p[0], p[1]])));
    if let [last] = pairs.remainder() {
        *carry = Some(*last);
    }

    samples
}

/// Encode samples as little-endian PCM16
pub fn samples_to_bytes(samples: &[AudioSample]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_format() {
        let format = AudioFormat::default();
        assert_eq!(format.sample_rate, 16000);
        assert_eq!(format.bit_depth, 16);
        assert_eq!(format.channels, 1);
    }

    #[test]
    fn test_samples_to_millis() {
        let format = AudioFormat::default();
        assert_eq!(format.samples_to_millis(16000), 1000);
        assert_eq!(format.samples_to_millis(800), 50);
    }

    #[test]
    fn test_decode_even_length() {
        let mut carry = None;
        let samples = decode_pcm16(&[0x01, 0x00, 0xff, 0xff], &mut carry);
        assert_eq!(samples, vec![1, -1]);
        assert!(carry.is_none());
    }

    #[test]
    fn test_decode_carries_odd_byte() {
        let mut carry = None;
        let bytes = samples_to_bytes(&[300, -2]);

        let first = decode_pcm16(&bytes[..3], &mut carry);
        assert_eq!(first, vec![300]);
        assert_eq!(carry, Some(bytes[2]));

        let second = decode_pcm16(&bytes[3..], &mut carry);
        assert_eq!(second, vec![-2]);
        assert!(carry.is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(AudioFormat::mono_pcm16(8000).to_string(), "8000Hz/16bit/1ch");
    }
}
