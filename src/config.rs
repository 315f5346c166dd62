//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: converts between these structs and TOML / JSON / env values
//! - **Result<T, E>**: every loading and validation step can fail and says why
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`, `PORT` and `COOKIE_PATH` (deployment platform conventions)
//! 2. Environment variables: `APP_<SECTION>__<KEY>`, e.g. `APP_QUEUE__MAX_CONNECTIONS=20`
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Runtime updates:
//! Only the `segmentation` section may change while the server runs. Queue
//! capacities size process-wide primitives created once at startup, and the
//! pipeline and storage sections are baked into the adapters.

use crate::audio::segmenter::SegmentParams;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub segmentation: SegmentationConfig,
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Browser origins allowed by CORS (comma separated in the environment)
    pub allowed_origins: Vec<String>,
}

/// Admission control settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Connected job channels (queued + active) before new ones get `queuefull`
    pub max_connections: usize,
    /// Jobs processed concurrently
    pub worker_slots: usize,
    /// How long an admitted client has to send its source reference
    pub source_timeout_secs: u64,
}

/// Silence detection tunables. See `audio::segmenter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationConfig {
    /// Rate the audio is decoded at before analysis
    pub sample_rate: u32,
    pub frame_length: usize,
    pub hop_length: usize,
    pub energy_threshold: f32,
    pub min_silence_seconds: f64,
    pub edge_gap_frames: usize,
}

impl SegmentationConfig {
    pub fn params(&self) -> SegmentParams {
        SegmentParams {
            frame_length: self.frame_length,
            hop_length: self.hop_length,
            energy_threshold: self.energy_threshold,
            min_silence_seconds: self.min_silence_seconds,
            edge_gap_frames: self.edge_gap_frames,
        }
    }
}

/// External tools used by the job pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub ytdlp_bin: String,
    pub ffmpeg_bin: String,
    /// Netscape cookie file passed to yt-dlp; empty for none
    pub cookie_path: String,
    pub audio_format: String,
    /// Target bitrate in kbit/s
    pub audio_quality: String,
    /// Parent directory of per-job working directories; empty for the system temp dir
    pub work_dir: String,
}

impl PipelineConfig {
    pub fn cookie_path(&self) -> Option<PathBuf> {
        non_empty_path(&self.cookie_path)
    }

    pub fn work_dir(&self) -> Option<PathBuf> {
        non_empty_path(&self.work_dir)
    }
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}

/// Published artifacts and their download links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory published objects are stored under
    pub root: String,
    /// Externally reachable base URL of this server, used in download links
    pub public_base_url: String,
    /// Lifetime of a download link; objects are swept after the same interval
    pub url_ttl_secs: u64,
    /// Key for download link signatures
    pub signing_secret: String,
    pub sweep_interval_secs: u64,
}

/// Placeholder secret shipped in the defaults.
pub const DEFAULT_SIGNING_SECRET: &str = "change-me";

impl Default for AppConfig {
    fn default() -> Self {
        let segment_defaults = SegmentParams::default();
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                allowed_origins: vec!["http://localhost:5173".to_string()],
            },
            queue: QueueConfig {
                max_connections: 10,
                worker_slots: 1,
                source_timeout_secs: 300,
            },
            segmentation: SegmentationConfig {
                sample_rate: 16000,
                frame_length: segment_defaults.frame_length,
                hop_length: segment_defaults.hop_length,
                energy_threshold: segment_defaults.energy_threshold,
                min_silence_seconds: segment_defaults.min_silence_seconds,
                edge_gap_frames: segment_defaults.edge_gap_frames,
            },
            pipeline: PipelineConfig {
                ytdlp_bin: "yt-dlp".to_string(),
                ffmpeg_bin: "ffmpeg".to_string(),
                cookie_path: String::new(),
                audio_format: "mp3".to_string(),
                audio_quality: "128".to_string(),
                work_dir: String::new(),
            },
            storage: StorageConfig {
                root: "./data/objects".to_string(),
                public_base_url: "http://127.0.0.1:8080".to_string(),
                url_ttl_secs: 3600,
                signing_secret: DEFAULT_SIGNING_SECRET.to_string(),
                sweep_interval_secs: 600,
            },
        }
    }
}

/// `APP_<SECTION>__<KEY>` variables.
///
/// Double underscore between section and key: keys themselves contain `_`.
fn env_source() -> config::Environment {
    config::Environment::with_prefix("APP")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("server.allowed_origins")
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Rust Concepts:
    /// - **Builder pattern**: Chain method calls to configure the config loader
    /// - **?**: Early return on error (if any step fails, return the error)
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(env_source());

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }
        if let Ok(cookies) = env::var("COOKIE_PATH") {
            settings = settings.set_override("pipeline.cookie_path", cookies)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.queue.max_connections == 0 {
            return Err(anyhow::anyhow!("queue.max_connections must be greater than 0"));
        }
        if self.queue.worker_slots == 0 {
            return Err(anyhow::anyhow!("queue.worker_slots must be greater than 0"));
        }
        if self.queue.worker_slots > self.queue.max_connections {
            return Err(anyhow::anyhow!(
                "queue.worker_slots ({}) cannot exceed queue.max_connections ({})",
                self.queue.worker_slots,
                self.queue.max_connections
            ));
        }
        if self.queue.source_timeout_secs == 0 {
            return Err(anyhow::anyhow!("queue.source_timeout_secs must be greater than 0"));
        }

        self.validate_segmentation()?;

        if self.pipeline.ytdlp_bin.trim().is_empty() || self.pipeline.ffmpeg_bin.trim().is_empty() {
            return Err(anyhow::anyhow!("pipeline tool paths cannot be empty"));
        }
        if self.pipeline.audio_format.trim().is_empty() {
            return Err(anyhow::anyhow!("pipeline.audio_format cannot be empty"));
        }

        if self.storage.root.trim().is_empty() {
            return Err(anyhow::anyhow!("storage.root cannot be empty"));
        }
        let base = url::Url::parse(&self.storage.public_base_url)
            .map_err(|e| anyhow::anyhow!("storage.public_base_url is invalid: {}", e))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(anyhow::anyhow!("storage.public_base_url must be http or https"));
        }
        if self.storage.url_ttl_secs == 0 {
            return Err(anyhow::anyhow!("storage.url_ttl_secs must be greater than 0"));
        }
        if self.storage.signing_secret.is_empty() {
            return Err(anyhow::anyhow!("storage.signing_secret cannot be empty"));
        }
        if self.storage.sweep_interval_secs == 0 {
            return Err(anyhow::anyhow!("storage.sweep_interval_secs must be greater than 0"));
        }

        Ok(())
    }

    fn validate_segmentation(&self) -> Result<()> {
        let seg = &self.segmentation;
        if seg.sample_rate == 0 {
            return Err(anyhow::anyhow!("segmentation.sample_rate must be greater than 0"));
        }
        if seg.frame_length == 0 || seg.hop_length == 0 {
            return Err(anyhow::anyhow!("segmentation frame_length and hop_length must be greater than 0"));
        }
        if !seg.energy_threshold.is_finite() || seg.energy_threshold <= 0.0 {
            return Err(anyhow::anyhow!("segmentation.energy_threshold must be a positive number"));
        }
        if !seg.min_silence_seconds.is_finite() || seg.min_silence_seconds < 0.0 {
            return Err(anyhow::anyhow!("segmentation.min_silence_seconds cannot be negative"));
        }
        Ok(())
    }

    /// Apply a partial JSON update of the runtime-tunable settings.
    ///
    /// Only the `segmentation` section is accepted; any other top-level key is
    /// an error and nothing is changed.
    ///
    /// ## Example:
    /// `{"segmentation": {"energy_threshold": 0.01}}` changes only the threshold.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        let object = partial_config
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("configuration update must be a JSON object"))?;

        if let Some(key) = object.keys().find(|key| key.as_str() != "segmentation") {
            return Err(anyhow::anyhow!(
                "'{}' cannot be changed at runtime; only 'segmentation' is updatable",
                key
            ));
        }

        let mut updated = self.segmentation.clone();
        if let Some(seg) = object.get("segmentation") {
            if let Some(rate) = seg.get("sample_rate").and_then(|v| v.as_u64()) {
                updated.sample_rate = u32::try_from(rate)?;
            }
            if let Some(frame) = seg.get("frame_length").and_then(|v| v.as_u64()) {
                updated.frame_length = frame as usize;
            }
            if let Some(hop) = seg.get("hop_length").and_then(|v| v.as_u64()) {
                updated.hop_length = hop as usize;
            }
            if let Some(threshold) = seg.get("energy_threshold").and_then(|v| v.as_f64()) {
                updated.energy_threshold = threshold as f32;
            }
            if let Some(min_silence) = seg.get("min_silence_seconds").and_then(|v| v.as_f64()) {
                updated.min_silence_seconds = min_silence;
            }
            if let Some(gap) = seg.get("edge_gap_frames").and_then(|v| v.as_u64()) {
                updated.edge_gap_frames = gap as usize;
            }
        }

        let previous = std::mem::replace(&mut self.segmentation, updated);
        if let Err(e) = self.validate_segmentation() {
            self.segmentation = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Copy safe to log or return over HTTP.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.storage.signing_secret = "***".to_string();
        copy
    }
}
