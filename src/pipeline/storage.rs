//! # Local Object Store
//!
//! Publishes job artifacts under a storage root and hands out expiring,
//! signed download links for them. The download route verifies the link
//! before serving the file; a background sweeper deletes objects once their
//! links can no longer be valid.
//!
//! ## Link format:
//! `{public_base_url}/hunnoi/downloads/{key}?expires={unix}&signature={hex}`
//! where the signature is `sha256(secret \n key \n expires \n secret)`.

use crate::config::StorageConfig;
use crate::pipeline::error::JobError;
use crate::pipeline::Publisher;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio_stream::wrappers::ReadDirStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use url::Url;

/// Why a download request was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadError {
    /// The key escapes the storage root or is malformed
    InvalidKey,
    /// The signature does not match the key and expiry
    BadSignature,
    /// The link is past its expiry
    Expired,
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadError::InvalidKey => write!(f, "invalid object key"),
            DownloadError::BadSignature => write!(f, "invalid download signature"),
            DownloadError::Expired => write!(f, "download link has expired"),
        }
    }
}

impl std::error::Error for DownloadError {}

/// Keyed signatures over `(key, expires)`.
#[derive(Clone)]
pub struct UrlSigner {
    secret: String,
}

impl UrlSigner {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    pub fn sign(&self, key: &str, expires: i64) -> String {
        let digest = Sha256::new()
            .chain_update(self.secret.as_bytes())
            .chain_update(b"\n")
            .chain_update(key.as_bytes())
            .chain_update(b"\n")
            .chain_update(expires.to_string().as_bytes())
            .chain_update(b"\n")
            .chain_update(self.secret.as_bytes())
            .finalize();
        hex::encode(digest)
    }

    /// Check a presented signature. `now` is a unix timestamp in seconds.
    pub fn verify(&self, key: &str, expires: i64, signature: &str, now: i64) -> Result<(), DownloadError> {
        let expected = self.sign(key, expires);
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Err(DownloadError::BadSignature);
        }
        if now > expires {
            return Err(DownloadError::Expired);
        }
        Ok(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Map an object key to a path under `root`, refusing anything that could
/// escape it.
pub fn object_path(root: &Path, key: &str) -> Result<PathBuf, DownloadError> {
    if key.contains('\\') {
        return Err(DownloadError::InvalidKey);
    }
    let clean = key
        .split('/')
        .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
    let relative = Path::new(key);
    if !clean || !relative.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(DownloadError::InvalidKey);
    }
    Ok(root.join(relative))
}

/// Publishes by copying into the storage root.
pub struct LocalPublisher {
    root: PathBuf,
    public_base_url: Url,
    ttl: Duration,
    signer: UrlSigner,
}

impl LocalPublisher {
    pub fn from_config(config: &StorageConfig) -> anyhow::Result<Self> {
        let public_base_url = Url::parse(&config.public_base_url)?;
        if public_base_url.cannot_be_a_base() {
            anyhow::bail!("storage.public_base_url must be an absolute http(s) URL");
        }
        Ok(Self {
            root: PathBuf::from(&config.root),
            public_base_url,
            ttl: Duration::from_secs(config.url_ttl_secs),
            signer: UrlSigner::new(config.signing_secret.clone()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    fn download_url(&self, key: &str, expires: i64) -> Result<String, JobError> {
        let mut url = self.public_base_url.clone();
        url.path_segments_mut()
            .map_err(|_| JobError::Publish("public base URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(["hunnoi", "downloads"])
            .extend(key.split('/'));
        url.query_pairs_mut()
            .clear()
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &self.signer.sign(key, expires));
        Ok(url.into())
    }
}

#[async_trait]
impl Publisher for LocalPublisher {
    async fn publish(&self, file: &Path, key: &str) -> Result<String, JobError> {
        let target = object_path(&self.root, key).map_err(|e| JobError::Publish(format!("{}: {}", key, e)))?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| JobError::Publish(e.to_string()))?;
        }
        let bytes = tokio::fs::copy(file, &target)
            .await
            .map_err(|e| JobError::Publish(e.to_string()))?;

        let expires = chrono::Utc::now().timestamp() + self.ttl.as_secs() as i64;
        let url = self.download_url(key, expires)?;
        info!(key, bytes, expires, "Published object");
        Ok(url)
    }
}

/// Delete every object under `root` last modified more than `max_age` ago,
/// then prune directories left empty. Returns the number of files removed.
pub async fn sweep_expired(root: &Path, max_age: Duration) -> std::io::Result<usize> {
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = 0;
    let mut pending = vec![root.to_path_buf()];
    let mut visited_dirs = Vec::new();

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(read_dir) => ReadDirStream::new(read_dir),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next().await {
            let entry = entry?;
            let metadata = entry.metadata().await?;
            if metadata.is_dir() {
                pending.push(entry.path());
            } else if metadata.modified()? < cutoff {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => {
                        debug!(path = %entry.path().display(), "Deleted expired object");
                        removed += 1;
                    }
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to delete expired object"),
                }
            }
        }
        if dir != root {
            visited_dirs.push(dir);
        }
    }

    // Deepest first; `remove_dir` only succeeds on empty directories.
    visited_dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
    for dir in visited_dirs {
        let _ = tokio::fs::remove_dir(&dir).await;
    }

    Ok(removed)
}

/// Run [`sweep_expired`] every `interval` until the task is aborted.
pub fn spawn_sweeper(root: PathBuf, interval: Duration, max_age: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match sweep_expired(&root, max_age).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Swept expired objects"),
                Err(e) => warn!(error = %e, root = %root.display(), "Object sweep failed"),
            }
        }
    })
}
