//! Stalled-job reaper and expiry sweep.
//!
//! Workers can die mid-job and queue messages can be lost (an enqueue that
//! failed after the record was written). The reaper periodically looks for
//! unfinished jobs that nobody is working on and puts them back on the queue,
//! then physically removes expired records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::{to_chrono, TranscriptionJob};
use super::queue::WorkQueue;
use super::store::JobStore;
use crate::common::JobId;

/// Decides whether an unfinished job has stalled.
pub trait LivenessPolicy: Send + Sync {
    fn is_stalled(&self, job: &TranscriptionJob, now: DateTime<Utc>) -> bool;
}

/// Stalled = no live claim and no write for `threshold`.
#[derive(Debug, Clone)]
pub struct UpdatedAtPolicy {
    pub threshold: Duration,
}

impl LivenessPolicy for UpdatedAtPolicy {
    fn is_stalled(&self, job: &TranscriptionJob, now: DateTime<Utc>) -> bool {
        !job.is_terminal() && !job.has_live_claim(now) && now - job.updated_at >= to_chrono(self.threshold)
    }
}

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    pub stall_threshold: Duration,
    /// Max unfinished jobs inspected per sweep.
    pub scan_limit: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stall_threshold: Duration::from_secs(900),
            scan_limit: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub purged: u64,
}

pub struct StalledJobReaper {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    policy: Arc<dyn LivenessPolicy>,
    config: ReaperConfig,
    recently_requeued: Mutex<HashMap<JobId, Instant>>,
}

impl StalledJobReaper {
    /// Reaper with the default `UpdatedAtPolicy`.
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn WorkQueue>, config: ReaperConfig) -> Self {
        let policy = Arc::new(UpdatedAtPolicy {
            threshold: config.stall_threshold,
        });
        Self::with_policy(store, queue, policy, config)
    }

    pub fn with_policy(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        policy: Arc<dyn LivenessPolicy>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            store,
            queue,
            policy,
            config,
            recently_requeued: Mutex::new(HashMap::new()),
        }
    }

    /// One pass: re-enqueue stalled jobs, then purge expired records.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        let unfinished = self.store.list_unfinished(self.config.scan_limit).await?;
        let mut recent = self.recently_requeued.lock().await;
        let window = self.config.stall_threshold;
        recent.retain(|_, at| at.elapsed() < window);

        for job in unfinished.iter().filter(|job| self.policy.is_stalled(job, now)) {
            if recent.contains_key(&job.id) {
                continue;
            }
            match self.queue.enqueue(job.id).await {
                Ok(()) => {
                    info!(job_id = %job.id, state = %job.state, "re-enqueued stalled job");
                    recent.insert(job.id, Instant::now());
                    report.requeued += 1;
                }
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to re-enqueue stalled job"),
            }
        }
        drop(recent);

        report.purged = self.store.purge_expired(now).await?;
        if report.purged > 0 {
            info!(purged = report.purged, "purged expired jobs");
        }

        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.config.interval.as_secs(), "reaper starting");
        let mut ticker = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) => debug!(requeued = report.requeued, purged = report.purged, "sweep finished"),
                        Err(e) => error!(error = %e, "sweep failed"),
                    }
                }
            }
        }

        info!("reaper stopped");
    }
}
