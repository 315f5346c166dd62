//! Source references and the metadata that comes back from probing them.

use crate::pipeline::error::JobError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use url::Url;

/// Characters that may not appear in a published file name.
const FORBIDDEN_FILENAME_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// A normalised media source reference.
///
/// Normalisation trims the input, requires an absolute `http`/`https` URL
/// with a host, and drops every query parameter except `v` (so playlist,
/// timestamp and tracking parameters never reach the retriever).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef(Url);

impl SourceRef {
    pub fn parse(raw: &str) -> Result<Self, JobError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(JobError::InvalidSource("empty source reference".to_string()));
        }

        let mut url = Url::parse(trimmed)
            .map_err(|e| JobError::InvalidSource(format!("{}: {}", trimmed, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(JobError::InvalidSource(format!("unsupported scheme '{}'", url.scheme())));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(JobError::InvalidSource(format!("{} has no host", trimmed)));
        }

        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key == "v")
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept);
        }

        Ok(Self(url))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the validation endpoint reports about a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub id: String,
    pub title: String,
    #[serde(rename = "thumbnails")]
    pub thumbnail: Option<String>,
}

/// A downloaded source inside the job's working directory.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedAudio {
    /// Sanitised title, safe to use in file names and object keys
    pub title: String,
    pub path: PathBuf,
}

/// Replace characters that are illegal in file names on common filesystems.
///
/// An all-blank result falls back to `"audio"` so object keys never end in
/// `/.mp3`.
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if FORBIDDEN_FILENAME_CHARS.contains(&c) || c.is_control() { '_' } else { c })
        .collect();
    let sanitized = sanitized.trim();
    if sanitized.is_empty() {
        "audio".to_string()
    } else {
        sanitized.to_string()
    }
}
