//! `ffmpeg` backed decoder and splitter.

use crate::audio::pcm::{s16le_to_f32, DecodedAudio};
use crate::audio::segmenter::TimeSegment;
use crate::pipeline::command::run_tool;
use crate::pipeline::error::JobError;
use crate::pipeline::{AudioSplitter, EnergyDecoder};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Decodes any input ffmpeg understands to mono `s16le` on stdout.
pub struct FfmpegDecoder {
    bin: String,
}

impl FfmpegDecoder {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

fn decode_args(audio: &Path, sample_rate: u32) -> Vec<OsString> {
    vec![
        "-nostdin".into(),
        "-v".into(),
        "error".into(),
        "-i".into(),
        audio.as_os_str().to_os_string(),
        "-ac".into(),
        "1".into(),
        "-ar".into(),
        sample_rate.to_string().into(),
        "-f".into(),
        "s16le".into(),
        "-".into(),
    ]
}

#[async_trait]
impl EnergyDecoder for FfmpegDecoder {
    async fn decode(&self, audio: &Path, sample_rate: u32) -> Result<DecodedAudio, JobError> {
        let pcm = run_tool(&self.bin, decode_args(audio, sample_rate))
            .await
            .map_err(|e| JobError::Decode(e.to_string()))?;
        debug!(bytes = pcm.len(), "Decoded PCM stream");

        let samples = tokio::task::spawn_blocking(move || s16le_to_f32(&pcm))
            .await
            .map_err(|e| JobError::Decode(format!("conversion task failed: {}", e)))?
            .map_err(|e| JobError::Decode(e.to_string()))?;

        Ok(DecodedAudio { samples, sample_rate })
    }
}

/// Cuts one output file per segment, several ffmpeg processes at a time.
pub struct FfmpegSplitter {
    bin: String,
    audio_format: String,
    parallelism: usize,
}

impl FfmpegSplitter {
    pub fn new(bin: impl Into<String>, audio_format: impl Into<String>) -> Self {
        let parallelism = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            bin: bin.into(),
            audio_format: audio_format.into(),
            parallelism,
        }
    }

    /// `NN_<title>.<ext>`, numbered from 1.
    fn track_path(&self, out_dir: &Path, index: usize, title: &str) -> PathBuf {
        out_dir.join(format!("{:02}_{}.{}", index + 1, title, self.audio_format))
    }
}

fn trim_args(audio: &Path, segment: &TimeSegment, output: &Path) -> Vec<OsString> {
    vec![
        "-nostdin".into(),
        "-v".into(),
        "error".into(),
        "-y".into(),
        "-i".into(),
        audio.as_os_str().to_os_string(),
        "-ss".into(),
        format!("{:.3}", segment.start).into(),
        "-to".into(),
        format!("{:.3}", segment.end).into(),
        "-vn".into(),
        output.as_os_str().to_os_string(),
    ]
}

#[async_trait]
impl AudioSplitter for FfmpegSplitter {
    async fn split(
        &self,
        audio: &Path,
        segments: &[TimeSegment],
        out_dir: &Path,
        title: &str,
    ) -> Result<Vec<PathBuf>, JobError> {
        info!(tracks = segments.len(), parallelism = self.parallelism, "Splitting audio");

        let jobs: Vec<(PathBuf, Vec<OsString>)> = segments
            .iter()
            .enumerate()
            .map(|(index, segment)| {
                let output = self.track_path(out_dir, index, title);
                let args = trim_args(audio, segment, &output);
                (output, args)
            })
            .collect();

        // `buffered` keeps the output in segment order.
        stream::iter(jobs)
            .map(|(output, args)| {
                let bin = self.bin.clone();
                async move {
                    run_tool(&bin, args)
                        .await
                        .map_err(|e| JobError::Split(e.to_string()))?;
                    Ok::<PathBuf, JobError>(output)
                }
            })
            .buffered(self.parallelism)
            .try_collect()
            .await
    }
}
