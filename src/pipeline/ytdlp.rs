//! `yt-dlp` backed source retriever.

use crate::config::PipelineConfig;
use crate::pipeline::command::run_tool;
use crate::pipeline::error::JobError;
use crate::pipeline::source::{sanitize_filename, RetrievedAudio, SourceMetadata, SourceRef};
use crate::pipeline::SourceRetriever;
use async_trait::async_trait;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Delay yt-dlp inserts between its own HTTP requests.
const SLEEP_REQUESTS_SECS: &str = "0.4";

/// Fields of yt-dlp's `--dump-json` output that we use.
#[derive(Debug, Deserialize)]
struct InfoJson {
    id: String,
    title: Option<String>,
    thumbnail: Option<String>,
}

pub struct YtDlpRetriever {
    bin: String,
    cookie_path: Option<PathBuf>,
    audio_format: String,
    audio_quality: String,
}

impl YtDlpRetriever {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            bin: config.ytdlp_bin.clone(),
            cookie_path: config.cookie_path(),
            audio_format: config.audio_format.clone(),
            audio_quality: config.audio_quality.clone(),
        }
    }

    fn common_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--no-warnings".into(), "--sleep-requests".into(), SLEEP_REQUESTS_SECS.into()];
        if let Some(cookies) = &self.cookie_path {
            args.push("--cookies".into());
            args.push(cookies.as_os_str().to_os_string());
        }
        args
    }

    fn download_args(&self, source: &SourceRef, work_dir: &Path) -> Vec<OsString> {
        let mut args = self.common_args();
        args.extend([
            "--format".into(),
            "bestaudio/best".into(),
            "--extract-audio".into(),
            "--audio-format".into(),
            OsString::from(&self.audio_format),
            "--audio-quality".into(),
            OsString::from(format!("{}K", self.audio_quality)),
            // Keep the source loudness; the silence threshold depends on it.
            "--postprocessor-args".into(),
            "ExtractAudio:-af anull".into(),
            "--dump-json".into(),
            "--no-simulate".into(),
            "--output".into(),
            work_dir.join("%(id)s.%(ext)s").into_os_string(),
            OsString::from(source.as_str()),
        ]);
        args
    }
}

/// First JSON document on yt-dlp's stdout.
fn parse_info(stdout: &[u8]) -> Result<InfoJson, JobError> {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with('{'))
        .ok_or_else(|| JobError::SourceUnavailable("yt-dlp printed no metadata".to_string()))?;
    serde_json::from_str(line).map_err(|e| JobError::SourceUnavailable(format!("unreadable yt-dlp metadata: {}", e)))
}

#[async_trait]
impl SourceRetriever for YtDlpRetriever {
    async fn probe(&self, source: &SourceRef) -> Result<SourceMetadata, JobError> {
        let mut args = self.common_args();
        args.extend(["--dump-json".into(), "--skip-download".into(), OsString::from(source.as_str())]);

        let stdout = run_tool(&self.bin, args)
            .await
            .map_err(|e| JobError::SourceUnavailable(e.to_string()))?;
        let info = parse_info(&stdout)?;
        debug!(id = %info.id, "Probed source");

        Ok(SourceMetadata {
            title: info.title.unwrap_or_else(|| info.id.clone()),
            id: info.id,
            thumbnail: info.thumbnail,
        })
    }

    async fn retrieve(&self, source: &SourceRef, work_dir: &Path) -> Result<RetrievedAudio, JobError> {
        info!(source = %source, "Downloading source audio");
        let stdout = run_tool(&self.bin, self.download_args(source, work_dir))
            .await
            .map_err(|e| JobError::SourceUnavailable(e.to_string()))?;
        let info = parse_info(&stdout)?;

        let path = work_dir.join(format!("{}.{}", info.id, self.audio_format));
        if !tokio::fs::try_exists(&path).await? {
            return Err(JobError::SourceUnavailable(format!(
                "yt-dlp finished but {} is missing",
                path.display()
            )));
        }

        let title = sanitize_filename(info.title.as_deref().unwrap_or(&info.id));
        info!(id = %info.id, title = %title, "Download completed");
        Ok(RetrievedAudio { title, path })
    }
}
