//! # Job Session
//!
//! Runs one admitted job: retrieve the source, find the track boundaries,
//! then either publish the raw audio (`break`) or split, zip and publish the
//! tracks (`completed`).
//!
//! ## Guarantees:
//! - a `processing` event precedes every stage;
//! - exactly one terminal event (`break`, `completed` or `error`) is sent,
//!   unless the client is already gone;
//! - the job's working directory is removed on every exit path, including
//!   cancellation.

use crate::audio::segmenter::{compute_segments, SegmentOutcome, SegmentParams};
use crate::config::AppConfig;
use crate::pipeline::{JobError, Pipeline, SourceRef};
use crate::protocol::StatusEvent;
use crate::queue::ClientChannel;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-job knobs, snapshotted from the configuration when the job starts.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub sample_rate: u32,
    pub segmentation: SegmentParams,
    /// Parent of the per-job working directories; system temp dir when `None`
    pub work_dir: Option<PathBuf>,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            sample_rate: config.segmentation.sample_rate,
            segmentation: config.segmentation.params(),
            work_dir: config.pipeline.work_dir(),
        }
    }
}

/// How a session ended, for the caller's bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed,
    Break,
    Failed(JobError),
    /// The client left; nothing more was sent
    Disconnected,
}

pub struct JobSession {
    channel: Arc<dyn ClientChannel>,
    pipeline: Arc<Pipeline>,
    settings: SessionSettings,
    tag: Uuid,
}

impl JobSession {
    pub fn new(channel: Arc<dyn ClientChannel>, pipeline: Arc<Pipeline>, settings: SessionSettings) -> Self {
        Self {
            channel,
            pipeline,
            settings,
            tag: Uuid::new_v4(),
        }
    }

    /// Object-key prefix unique to this job.
    pub fn tag(&self) -> Uuid {
        self.tag
    }

    /// Run the job and send its terminal event.
    pub async fn run(&self, source: &SourceRef) -> SessionOutcome {
        let channel_id = self.channel.id();
        info!(channel_id = %channel_id, tag = %self.tag, source = %source, "Job started");

        let workspace = match self.create_workspace().await {
            Ok(workspace) => workspace,
            Err(err) => return self.fail(err).await,
        };

        let result = self.execute(source, workspace.path()).await;

        let path = workspace.path().to_path_buf();
        match tokio::task::spawn_blocking(move || workspace.close()).await {
            Ok(Ok(())) => debug!(tag = %self.tag, "Working directory removed"),
            Ok(Err(e)) => warn!(tag = %self.tag, path = %path.display(), error = %e, "Failed to remove working directory"),
            Err(e) => warn!(tag = %self.tag, error = %e, "Working directory cleanup task failed"),
        }

        match result {
            Ok(terminal) => {
                debug_assert!(terminal.is_terminal());
                let outcome = match terminal {
                    StatusEvent::Completed { .. } => SessionOutcome::Completed,
                    _ => SessionOutcome::Break,
                };
                if self.channel.send(terminal).await.is_err() {
                    info!(channel_id = %channel_id, tag = %self.tag, "Client left before the result was delivered");
                    return SessionOutcome::Disconnected;
                }
                info!(channel_id = %channel_id, tag = %self.tag, outcome = ?outcome, "Job finished");
                outcome
            }
            Err(err) => self.fail(err).await,
        }
    }

    async fn fail(&self, err: JobError) -> SessionOutcome {
        if err == JobError::Disconnected {
            info!(channel_id = %self.channel.id(), tag = %self.tag, "Client disconnected mid-job");
            return SessionOutcome::Disconnected;
        }

        warn!(channel_id = %self.channel.id(), tag = %self.tag, error = %err, "Job failed");
        if self.channel.send(StatusEvent::error(err.user_message())).await.is_err() {
            return SessionOutcome::Disconnected;
        }
        SessionOutcome::Failed(err)
    }

    /// Filesystem work runs on the blocking pool, off the runtime threads.
    async fn create_workspace(&self) -> Result<TempDir, JobError> {
        let work_dir = self.settings.work_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<TempDir, JobError> {
            let mut builder = tempfile::Builder::new();
            builder.prefix("playlist-job-");
            let workspace = match &work_dir {
                Some(parent) => {
                    std::fs::create_dir_all(parent)?;
                    builder.tempdir_in(parent)?
                }
                None => builder.tempdir()?,
            };
            Ok(workspace)
        })
        .await
        .map_err(|e| JobError::Io(format!("workspace task failed: {}", e)))?
    }

    async fn progress(&self, message: &str) -> Result<(), JobError> {
        debug!(tag = %self.tag, message, "Stage starting");
        self.channel.send(StatusEvent::processing(message)).await?;
        Ok(())
    }

    /// All stages; returns the terminal event to send.
    async fn execute(&self, source: &SourceRef, work_dir: &Path) -> Result<StatusEvent, JobError> {
        self.progress("Fetching the playlist").await?;
        let audio = self.pipeline.retriever.retrieve(source, work_dir).await?;

        self.progress("Checking the tracks").await?;
        let decoded = self.pipeline.decoder.decode(&audio.path, self.settings.sample_rate).await?;
        debug!(tag = %self.tag, seconds = decoded.duration_seconds(), "Audio decoded");
        let params = self.settings.segmentation.clone();
        let outcome = tokio::task::spawn_blocking(move || compute_segments(&decoded.samples, decoded.sample_rate, &params))
            .await
            .map_err(|e| JobError::Decode(format!("segmentation task failed: {}", e)))?;

        let segments = match outcome {
            SegmentOutcome::Split(segments) if segments.len() > 2 => segments,
            other => {
                info!(tag = %self.tag, segments = other.segments().len(), "Playlist cannot be split, publishing it whole");
                self.progress("Creating the download link").await?;
                let extension = audio
                    .path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .unwrap_or("mp3");
                let key = format!("{}/{}.{}", self.tag, audio.title, extension);
                let download_url = self.pipeline.publisher.publish(&audio.path, &key).await?;
                return Ok(StatusEvent::Break {
                    message: "This playlist cannot be split into tracks, but you can download it whole.".to_string(),
                    download_url,
                });
            }
        };

        info!(tag = %self.tag, tracks = segments.len(), "Splitting playlist");
        for (i, segment) in segments.iter().enumerate() {
            debug!(tag = %self.tag, track = i + 1, start = segment.start, seconds = segment.duration(), "Track boundary");
        }
        self.progress("This playlist can be split, splitting the tracks").await?;
        let tracks_dir = work_dir.join("tracks");
        tokio::fs::create_dir_all(&tracks_dir).await?;
        let tracks = self
            .pipeline
            .splitter
            .split(&audio.path, &segments, &tracks_dir, &audio.title)
            .await?;

        self.progress("Tracks split, creating the download link").await?;
        let archive_name = format!("playlist_{}.zip", audio.title);
        let archive = self
            .pipeline
            .packager
            .package(&tracks, &work_dir.join(&archive_name))
            .await?;
        let key = format!("{}/{}", self.tag, archive_name);
        let download_url = self.pipeline.publisher.publish(&archive, &key).await?;

        Ok(StatusEvent::Completed {
            message: "Download link created.".to_string(),
            download_url,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Fake capabilities shared by the session and dispatcher tests.

    use crate::audio::pcm::DecodedAudio;
    use crate::audio::segmenter::{SegmentParams, TimeSegment};
    use crate::pipeline::archive::ZipPackager;
    use crate::pipeline::*;
    use crate::queue::channel::test_support::MemoryChannel;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    pub const SAMPLE_RATE: u32 = 100;

    /// Parameters scaled down for a 100 Hz test signal.
    pub fn test_params() -> SegmentParams {
        SegmentParams {
            frame_length: 2,
            hop_length: 1,
            energy_threshold: 0.1,
            min_silence_seconds: 0.5,
            edge_gap_frames: 10,
        }
    }

    /// `tracks` loud runs of 3 s, each surrounded by 1 s of silence.
    pub fn playlist_samples(tracks: usize) -> Vec<f32> {
        let sr = SAMPLE_RATE as usize;
        let mut samples = vec![0.0f32; sr];
        for _ in 0..tracks {
            samples.extend(vec![0.5f32; 3 * sr]);
            samples.extend(vec![0.0f32; sr]);
        }
        samples
    }

    #[derive(Default)]
    pub struct FakeRetriever {
        pub fail: Option<JobError>,
        /// Channel to drop mid-retrieval
        pub disconnect: Option<Arc<MemoryChannel>>,
        pub seen_work_dirs: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl SourceRetriever for FakeRetriever {
        async fn probe(&self, source: &SourceRef) -> Result<SourceMetadata, JobError> {
            if let Some(err) = &self.fail {
                return Err(err.clone());
            }
            Ok(SourceMetadata {
                id: "abc".to_string(),
                title: format!("Mix from {}", source),
                thumbnail: None,
            })
        }

        async fn retrieve(&self, _source: &SourceRef, work_dir: &Path) -> Result<RetrievedAudio, JobError> {
            self.seen_work_dirs.lock().unwrap().push(work_dir.to_path_buf());
            if let Some(channel) = &self.disconnect {
                channel.disconnect();
            }
            if let Some(err) = &self.fail {
                return Err(err.clone());
            }
            let path = work_dir.join("abc.mp3");
            tokio::fs::write(&path, b"raw audio").await?;
            Ok(RetrievedAudio {
                title: "Mix".to_string(),
                path,
            })
        }
    }

    pub struct FakeDecoder {
        pub tracks: usize,
    }

    #[async_trait]
    impl EnergyDecoder for FakeDecoder {
        async fn decode(&self, _audio: &Path, _sample_rate: u32) -> Result<DecodedAudio, JobError> {
            Ok(DecodedAudio {
                samples: playlist_samples(self.tracks),
                sample_rate: SAMPLE_RATE,
            })
        }
    }

    #[derive(Default)]
    pub struct FakeSplitter {
        pub segments_seen: Mutex<Vec<TimeSegment>>,
    }

    #[async_trait]
    impl AudioSplitter for FakeSplitter {
        async fn split(
            &self,
            _audio: &Path,
            segments: &[TimeSegment],
            out_dir: &Path,
            title: &str,
        ) -> Result<Vec<PathBuf>, JobError> {
            self.segments_seen.lock().unwrap().extend_from_slice(segments);
            let mut files = Vec::new();
            for (i, _) in segments.iter().enumerate() {
                let path = out_dir.join(format!("{:02}_{}.mp3", i + 1, title));
                tokio::fs::write(&path, format!("track {}", i + 1)).await?;
                files.push(path);
            }
            Ok(files)
        }
    }

    #[derive(Default)]
    pub struct FakePublisher {
        pub fail: bool,
        pub published: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Publisher for FakePublisher {
        async fn publish(&self, file: &Path, key: &str) -> Result<String, JobError> {
            if self.fail {
                return Err(JobError::Publish("bucket unreachable".to_string()));
            }
            assert!(file.exists(), "published file must exist at publish time");
            self.published.lock().unwrap().push(key.to_string());
            Ok(format!("https://dl.test/{}", key))
        }
    }

    pub struct Fakes {
        pub retriever: Arc<FakeRetriever>,
        pub splitter: Arc<FakeSplitter>,
        pub publisher: Arc<FakePublisher>,
        pub pipeline: Arc<Pipeline>,
    }

    pub fn fakes(tracks: usize, retriever: FakeRetriever, publisher: FakePublisher) -> Fakes {
        let retriever = Arc::new(retriever);
        let splitter = Arc::new(FakeSplitter::default());
        let publisher = Arc::new(publisher);
        let pipeline = Arc::new(Pipeline {
            retriever: retriever.clone(),
            decoder: Arc::new(FakeDecoder { tracks }),
            splitter: splitter.clone(),
            packager: Arc::new(ZipPackager),
            publisher: publisher.clone(),
        });
        Fakes {
            retriever,
            splitter,
            publisher,
            pipeline,
        }
    }
}
