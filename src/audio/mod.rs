//! # Audio Analysis Module
//!
//! Everything the job pipeline needs to reason about the *content* of a
//! downloaded audio file. Decoding and trimming are delegated to external
//! tools (see `pipeline::ffmpeg`); this module stays pure.
//!
//! ## Key Components:
//! - **pcm**: raw 16-bit PCM bytes to normalised `f32` samples
//! - **segmenter**: silence detection and track boundary calculation
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz by default (configurable)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod pcm;
pub mod segmenter;
