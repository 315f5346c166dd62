//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket connection.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers (and the job dispatcher) hold the same config
//! - **RwLock**: many readers OR one writer at a time
//!
//! The config lock is shared with the [`Dispatcher`], so a runtime update of
//! the segmentation settings applies to the next job that starts.
//!
//! ### Lock poisoning
//! A lock is poisoned when a thread panics while holding it. None of the
//! critical sections below can panic, so a poisoned lock still holds
//! consistent data and is recovered with `into_inner` instead of unwrapped.

use crate::config::AppConfig;
use crate::dispatcher::Dispatcher;
use crate::pipeline::storage::LocalPublisher;
use crate::pipeline::Pipeline;
use crate::queue::{AdmissionController, ChannelRegistry};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Runtime-updatable configuration, shared with the dispatcher
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP request metrics, updated by the telemetry middleware
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Queue, worker pool and job sessions
    pub dispatcher: Arc<Dispatcher>,

    /// Processing capabilities, also used by the source validation endpoint
    pub pipeline: Arc<Pipeline>,

    /// Object store behind the download route
    pub publisher: Arc<LocalPublisher>,

    pub start_time: Instant,
}

/// HTTP request metrics collected since server start.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Key: endpoint name (e.g. "GET /hunnoi/health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Per-endpoint request statistics.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Wire the default pipeline (yt-dlp, ffmpeg, zip, local storage) from config.
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let (pipeline, publisher) = Pipeline::from_config(&config)?;
        Ok(Self::with_pipeline(config, Arc::new(pipeline), publisher))
    }

    /// Build the queue and dispatcher around an already wired pipeline.
    pub fn with_pipeline(config: AppConfig, pipeline: Arc<Pipeline>, publisher: Arc<LocalPublisher>) -> Self {
        let registry = Arc::new(ChannelRegistry::new(config.queue.max_connections));
        let admission = Arc::new(AdmissionController::new(config.queue.worker_slots));
        let config = Arc::new(RwLock::new(config));
        let dispatcher = Arc::new(Dispatcher::new(registry, admission, pipeline.clone(), config.clone()));

        Self {
            config,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            dispatcher,
            pipeline,
            publisher,
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration; the lock is released on return.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Apply a partial JSON update, validated before it becomes visible.
    ///
    /// Returns the new configuration on success.
    pub fn update_config(&self, json: &str) -> anyhow::Result<AppConfig> {
        let mut config = self.config.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut updated = config.clone();
        updated.update_from_json(json)?;
        updated.validate()?;
        *config = updated.clone();
        Ok(updated)
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Record one finished request against its endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Consistent copy of the metrics, so no lock is held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_ref().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
