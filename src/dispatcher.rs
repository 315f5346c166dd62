//! # Connection Dispatcher
//!
//! The lifecycle of one job connection, start to finish:
//!
//! 1. **register**: rejected channels get `queuefull` and a 1008 close
//! 2. **admit or abandon**: wait for a worker slot while watching the channel;
//!    an admitted channel gets no further queue positions
//! 3. **prompt**: send `waiting`, read the source reference (with a timeout)
//! 4. **run**: hand the job to a [`JobSession`]
//! 5. **teardown**: release the slot, close the channel, unregister
//!
//! Unregistration happens on every path, so followers always move up.

use crate::config::AppConfig;
use crate::pipeline::{JobError, Pipeline, SourceRef};
use crate::protocol::{CloseCode, StatusEvent};
use crate::queue::{
    Admission, AdmissionController, ChannelRegistry, ClientChannel, Inbound, Registration,
};
use crate::session::{JobSession, SessionOutcome, SessionSettings};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

/// Job counters since startup.
#[derive(Debug, Default)]
pub struct JobStats {
    completed: AtomicU64,
    broken: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    rejected: AtomicU64,
    active: AtomicUsize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatsSnapshot {
    pub completed: u64,
    /// Jobs that ended on the whole-file fallback
    pub broken: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub rejected: u64,
    pub active: usize,
}

impl JobStats {
    pub fn snapshot(&self) -> JobStatsSnapshot {
        JobStatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            broken: self.broken.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Marks a job as active for as long as it lives.
struct ActiveJob<'a>(&'a AtomicUsize);

impl<'a> ActiveJob<'a> {
    fn start(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveJob<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct Dispatcher {
    registry: Arc<ChannelRegistry>,
    admission: Arc<AdmissionController>,
    pipeline: Arc<Pipeline>,
    config: Arc<RwLock<AppConfig>>,
    stats: JobStats,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        admission: Arc<AdmissionController>,
        pipeline: Arc<Pipeline>,
        config: Arc<RwLock<AppConfig>>,
    ) -> Self {
        Self {
            registry,
            admission,
            pipeline,
            config,
            stats: JobStats::default(),
        }
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn stats(&self) -> JobStatsSnapshot {
        self.stats.snapshot()
    }

    /// Serve one connection until its job ends or the client leaves.
    pub async fn serve(&self, channel: Arc<dyn ClientChannel>) {
        let id = channel.id();

        if let Registration::Rejected(reason) = self.registry.register(channel.clone()).await {
            JobStats::bump(&self.stats.rejected);
            info!(channel_id = %id, reason = ?reason, "Connection rejected");
            if channel.send(StatusEvent::QueueFull).await.is_ok() {
                let _ = channel.close(CloseCode::Policy).await;
            }
            return;
        }

        self.serve_registered(channel).await;
        self.registry.unregister(id).await;
    }

    /// Close the worker pool and every open channel (shutdown only).
    pub async fn shutdown(&self) {
        self.admission.close();
        self.registry.close_all().await;
    }

    async fn serve_registered(&self, channel: Arc<dyn ClientChannel>) {
        let id = channel.id();

        let permit = match self.admission.admit_or_abandon(channel.as_ref()).await {
            Admission::Admitted(permit) => permit,
            Admission::Abandoned => {
                JobStats::bump(&self.stats.abandoned);
                return;
            }
        };
        let _active = ActiveJob::start(&self.stats.active);
        self.registry.mark_admitted(id).await;

        if channel.send(StatusEvent::Waiting).await.is_err() {
            info!(channel_id = %id, "Client left before it was prompted");
            JobStats::bump(&self.stats.abandoned);
            return;
        }

        let (timeout, settings) = {
            let config = self.config_snapshot();
            (
                Duration::from_secs(config.queue.source_timeout_secs),
                SessionSettings::from_config(&config),
            )
        };

        let source = match self.read_source(channel.as_ref(), timeout).await {
            Ok(source) => source,
            Err(JobError::Disconnected) => {
                info!(channel_id = %id, "Client left before sending a source");
                JobStats::bump(&self.stats.abandoned);
                return;
            }
            Err(err) => {
                warn!(channel_id = %id, error = %err, "No usable source reference");
                JobStats::bump(&self.stats.failed);
                if channel.send(StatusEvent::error(err.user_message())).await.is_ok() {
                    let _ = channel.close(CloseCode::Normal).await;
                }
                return;
            }
        };

        let session = JobSession::new(channel.clone(), self.pipeline.clone(), settings);
        info!(channel_id = %id, tag = %session.tag(), "Running job");
        let outcome = session.run(&source).await;
        match &outcome {
            SessionOutcome::Completed => JobStats::bump(&self.stats.completed),
            SessionOutcome::Break => JobStats::bump(&self.stats.broken),
            SessionOutcome::Failed(_) => JobStats::bump(&self.stats.failed),
            SessionOutcome::Disconnected => JobStats::bump(&self.stats.abandoned),
        }

        drop(permit);
        if outcome != SessionOutcome::Disconnected {
            let _ = channel.close(CloseCode::Normal).await;
        }
    }

    async fn read_source(&self, channel: &dyn ClientChannel, timeout: Duration) -> Result<SourceRef, JobError> {
        match tokio::time::timeout(timeout, channel.recv()).await {
            Err(_) => Err(JobError::Timeout),
            Ok(None) => Err(JobError::Disconnected),
            Ok(Some(Inbound::Binary(_))) => Err(JobError::InvalidSource("binary message".to_string())),
            Ok(Some(Inbound::Text(text))) => SourceRef::parse(&text),
        }
    }

    fn config_snapshot(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
