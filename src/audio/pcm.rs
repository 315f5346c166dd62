//! # PCM Conversion
//!
//! The decoder adapter asks ffmpeg for raw mono 16-bit little-endian PCM.
//! This module turns those bytes into the normalised `f32` samples the
//! segmenter works on.
//!
//! ## Format:
//! - **Encoding**: signed 16-bit integers, little-endian (`s16le`)
//! - **Channels**: mono, one sample per 2 bytes
//! - **Normalisation**: `sample / 32768.0`, so the range is `[-1.0, 1.0)`

use byteorder::{LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;

/// Decoded mono signal with its sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PcmError {
    /// No bytes at all
    Empty,
    /// Odd byte count: the stream was cut inside a sample
    Truncated { len: usize },
}

impl fmt::Display for PcmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PcmError::Empty => write!(f, "decoded audio is empty"),
            PcmError::Truncated { len } => {
                write!(f, "PCM stream length {} is not a multiple of 2 bytes", len)
            }
        }
    }
}

impl std::error::Error for PcmError {}

/// Convert raw `s16le` bytes to normalised samples.
///
/// ## Rust Concepts:
/// - **Cursor**: reads a byte slice as if it were a file
/// - **while let Ok(...)**: keep reading until the cursor runs dry
pub fn s16le_to_f32(data: &[u8]) -> Result<Vec<f32>, PcmError> {
    if data.is_empty() {
        return Err(PcmError::Empty);
    }
    if data.len() % 2 != 0 {
        return Err(PcmError::Truncated { len: data.len() });
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }
    Ok(samples)
}
