//! # Job Pipeline Capabilities
//!
//! A job session never shells out or touches storage itself. It calls five
//! capabilities, each an `async_trait` object injected through [`Pipeline`]:
//!
//! | capability        | default adapter                    |
//! |-------------------|------------------------------------|
//! | `SourceRetriever` | `yt-dlp` child process             |
//! | `EnergyDecoder`   | `ffmpeg` to mono 16-bit PCM        |
//! | `AudioSplitter`   | one `ffmpeg` process per track     |
//! | `Packager`        | deflate zip on a blocking thread   |
//! | `Publisher`       | local object store with signed URLs|
//!
//! Tests swap any of them for in-memory fakes.

pub mod archive;
pub mod command;
pub mod error;
pub mod ffmpeg;
pub mod source;
pub mod storage;
pub mod ytdlp;

pub use error::JobError;
pub use source::{sanitize_filename, RetrievedAudio, SourceMetadata, SourceRef};

use crate::audio::pcm::DecodedAudio;
use crate::audio::segmenter::TimeSegment;
use crate::config::AppConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Fetches media for a source reference.
#[async_trait]
pub trait SourceRetriever: Send + Sync {
    /// Look the source up without downloading it.
    async fn probe(&self, source: &SourceRef) -> Result<SourceMetadata, JobError>;

    /// Download the source's audio into `work_dir`.
    async fn retrieve(&self, source: &SourceRef, work_dir: &Path) -> Result<RetrievedAudio, JobError>;
}

/// Decodes an audio file to mono samples at `sample_rate`.
#[async_trait]
pub trait EnergyDecoder: Send + Sync {
    async fn decode(&self, audio: &Path, sample_rate: u32) -> Result<DecodedAudio, JobError>;
}

/// Cuts an audio file into one file per segment, in segment order.
#[async_trait]
pub trait AudioSplitter: Send + Sync {
    async fn split(
        &self,
        audio: &Path,
        segments: &[TimeSegment],
        out_dir: &Path,
        title: &str,
    ) -> Result<Vec<PathBuf>, JobError>;
}

/// Bundles files into a single archive at `archive`.
#[async_trait]
pub trait Packager: Send + Sync {
    async fn package(&self, files: &[PathBuf], archive: &Path) -> Result<PathBuf, JobError>;
}

/// Stores an artifact under `key` and returns an expiring download URL.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, file: &Path, key: &str) -> Result<String, JobError>;
}

/// The capability set a job session runs against.
#[derive(Clone)]
pub struct Pipeline {
    pub retriever: Arc<dyn SourceRetriever>,
    pub decoder: Arc<dyn EnergyDecoder>,
    pub splitter: Arc<dyn AudioSplitter>,
    pub packager: Arc<dyn Packager>,
    pub publisher: Arc<dyn Publisher>,
}

impl Pipeline {
    /// Wire the default external-tool adapters. Returns the local publisher
    /// separately as well, since the download route needs its signer and root.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<(Self, Arc<storage::LocalPublisher>)> {
        let publisher = Arc::new(storage::LocalPublisher::from_config(&config.storage)?);
        let pipeline = Self {
            retriever: Arc::new(ytdlp::YtDlpRetriever::from_config(&config.pipeline)),
            decoder: Arc::new(ffmpeg::FfmpegDecoder::new(config.pipeline.ffmpeg_bin.clone())),
            splitter: Arc::new(ffmpeg::FfmpegSplitter::new(
                config.pipeline.ffmpeg_bin.clone(),
                config.pipeline.audio_format.clone(),
            )),
            packager: Arc::new(archive::ZipPackager),
            publisher: publisher.clone(),
        };
        Ok((pipeline, publisher))
    }
}
