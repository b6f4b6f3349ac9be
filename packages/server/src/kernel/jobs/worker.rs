//! Job worker service for running transcription jobs.
//!
//! The `JobWorker` is a long-running loop that:
//! - Pulls job ids from the `WorkQueue`
//! - Claims the job through the `PipelineCoordinator`
//! - Runs the pipeline on its own task, so a panicking executor is caught
//! - Heartbeats the claim lease and the queue delivery while the job runs
//! - Stops the pipeline as soon as a heartbeat finds the claim taken over
//! - Acks or releases the delivery when done
//!
//! # Architecture
//!
//! ```text
//! JobWorker
//!     │
//!     ├─► queue.dequeue()            (at-least-once delivery)
//!     ├─► coordinator.claim()        (exactly one winner per job)
//!     ├─► spawn coordinator.execute() + heartbeat task
//!     └─► queue.ack() / queue.release()
//! ```

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::ErrorKind;
use super::queue::{Delivery, WorkQueue};
use super::store::StoreError;
use crate::domains::transcription::{ClaimOutcome, PipelineCoordinator};
use crate::kernel::deps::ServerDeps;

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Worker ID for this instance
    pub worker_id: String,
    /// How long to wait when the queue is empty
    pub poll_interval: Duration,
    /// How long a delivery stays hidden before redelivery
    pub visibility: Duration,
    /// How often to renew the claim lease and the delivery
    pub heartbeat_interval: Duration,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval: Duration::from_secs(1),
            visibility: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl JobWorkerConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    /// Visibility matches the claim lease; heartbeats run four times per lease.
    pub fn for_lease(worker_id: impl Into<String>, lease: Duration) -> Self {
        Self {
            worker_id: worker_id.into(),
            visibility: lease,
            heartbeat_interval: (lease / 4).max(Duration::from_millis(100)),
            ..Default::default()
        }
    }
}

/// Why a running job was stopped before it finished.
enum Interrupted {
    ClaimLost,
    Shutdown,
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Job reached a terminal state here.
    Finished,
    /// Nothing to run: already terminal, unknown, or we lost the claim.
    Skipped,
    /// Given back to the queue for a later attempt.
    Released,
}

pub struct JobWorker {
    queue: Arc<dyn WorkQueue>,
    coordinator: PipelineCoordinator,
    config: JobWorkerConfig,
}

impl JobWorker {
    pub fn new(queue: Arc<dyn WorkQueue>, coordinator: PipelineCoordinator, config: JobWorkerConfig) -> Self {
        Self {
            queue,
            coordinator,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Poll until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(worker_id = %self.config.worker_id, "job worker starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let delivery = match self
                .queue
                .dequeue(&self.config.worker_id, self.config.visibility)
                .await
            {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                    continue;
                }
                Err(e) => {
                    error!(worker_id = %self.config.worker_id, error = %e, "failed to dequeue");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };

            self.process(delivery, &shutdown).await;
        }

        info!(worker_id = %self.config.worker_id, "job worker stopped");
        Ok(())
    }

    /// Handle one delivery end to end.
    pub async fn process(&self, delivery: Delivery, shutdown: &CancellationToken) -> DeliveryOutcome {
        let job_id = delivery.job_id;
        debug!(
            job_id = %job_id,
            worker_id = %self.config.worker_id,
            delivery_count = delivery.delivery_count,
            "received delivery"
        );

        let claimed = match self.coordinator.claim(job_id, &self.config.worker_id).await {
            Ok(ClaimOutcome::Claimed(claimed)) => claimed,
            Ok(ClaimOutcome::AlreadyClaimed { worker_id }) => {
                // Check back once the holder's lease could have lapsed.
                debug!(job_id = %job_id, holder = %worker_id, "job claimed elsewhere");
                let delay = self.coordinator.settings().lease;
                return self.release(&delivery, delay).await;
            }
            Ok(ClaimOutcome::Finished(state)) => {
                debug!(job_id = %job_id, %state, "job already finished");
                return self.ack(&delivery, DeliveryOutcome::Skipped).await;
            }
            Ok(ClaimOutcome::Missing) => {
                debug!(job_id = %job_id, "job not found, dropping delivery");
                return self.ack(&delivery, DeliveryOutcome::Skipped).await;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to claim job");
                return self.release(&delivery, self.config.poll_interval).await;
            }
        };

        let token = claimed.token;
        let heartbeat_cancel = CancellationToken::new();
        let claim_lost = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(&delivery, token, heartbeat_cancel.clone(), claim_lost.clone());

        let coordinator = self.coordinator.clone();
        let mut task = tokio::spawn(async move { coordinator.execute(claimed).await });

        let joined = tokio::select! {
            biased;
            joined = &mut task => Ok(joined),
            _ = claim_lost.cancelled() => Err(Interrupted::ClaimLost),
            _ = shutdown.cancelled() => Err(Interrupted::Shutdown),
        };

        heartbeat_cancel.cancel();
        let _ = heartbeat.await;

        let joined = match joined {
            Ok(joined) => joined,
            Err(interrupted) => {
                // Stop the executor before anyone else runs the same stage.
                task.abort();
                let _ = task.await;
                return match interrupted {
                    Interrupted::ClaimLost => {
                        // The job belongs to another worker now; leave it alone.
                        warn!(
                            job_id = %job_id,
                            worker_id = %self.config.worker_id,
                            "claim lost mid-job, stopped pipeline"
                        );
                        self.ack(&delivery, DeliveryOutcome::Skipped).await
                    }
                    Interrupted::Shutdown => {
                        // Hand the job back so the next worker resumes from the last checkpoint.
                        info!(job_id = %job_id, "shutdown, releasing in-flight job");
                        if let Err(e) = self.coordinator.release(job_id, token).await {
                            warn!(job_id = %job_id, error = %e, "failed to release claim");
                        }
                        self.release(&delivery, Duration::ZERO).await
                    }
                };
            }
        };

        match joined {
            Ok(Ok(job)) => {
                debug!(job_id = %job_id, state = %job.state, "job finished");
                self.ack(&delivery, DeliveryOutcome::Finished).await
            }
            Ok(Err(StoreError::ClaimLost(_))) => {
                warn!(job_id = %job_id, worker_id = %self.config.worker_id, "claim lost, stopping");
                self.ack(&delivery, DeliveryOutcome::Skipped).await
            }
            Ok(Err(e)) => {
                error!(job_id = %job_id, error = %e, "store error while running job");
                self.release(&delivery, self.config.poll_interval).await
            }
            Err(join_error) if join_error.is_panic() => {
                let message = panic_message(join_error.into_panic());
                error!(job_id = %job_id, panic = %message, "executor panicked");
                match self
                    .coordinator
                    .abort(job_id, token, ErrorKind::InternalError, format!("executor panicked: {message}"))
                    .await
                {
                    Ok(_) => self.ack(&delivery, DeliveryOutcome::Finished).await,
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "failed to record panic");
                        self.release(&delivery, self.config.poll_interval).await
                    }
                }
            }
            Err(join_error) => {
                warn!(job_id = %job_id, error = %join_error, "job task cancelled");
                self.release(&delivery, self.config.poll_interval).await
            }
        }
    }

    /// Renew the lease and the delivery until `cancel` fires. Cancels
    /// `claim_lost` when the store says the claim is no longer ours.
    fn spawn_heartbeat(
        &self,
        delivery: &Delivery,
        token: Uuid,
        cancel: CancellationToken,
        claim_lost: CancellationToken,
    ) -> JoinHandle<()> {
        let coordinator = self.coordinator.clone();
        let queue = self.queue.clone();
        let job_id = delivery.job_id;
        let receipt = delivery.receipt;
        let interval = self.config.heartbeat_interval;
        let visibility = self.config.visibility;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match coordinator.heartbeat(job_id, token).await {
                            Ok(()) => {}
                            Err(StoreError::ClaimLost(_)) | Err(StoreError::NotFound(_)) => {
                                warn!(job_id = %job_id, "heartbeat rejected, claim is gone");
                                claim_lost.cancel();
                                break;
                            }
                            Err(e) => warn!(job_id = %job_id, error = %e, "heartbeat failed"),
                        }
                        if let Err(e) = queue.extend(receipt, visibility).await {
                            warn!(job_id = %job_id, error = %e, "failed to extend delivery");
                        }
                    }
                }
            }
        })
    }

    async fn ack(&self, delivery: &Delivery, outcome: DeliveryOutcome) -> DeliveryOutcome {
        if let Err(e) = self.queue.ack(delivery.receipt).await {
            warn!(job_id = %delivery.job_id, error = %e, "failed to ack delivery");
        }
        outcome
    }

    async fn release(&self, delivery: &Delivery, delay: Duration) -> DeliveryOutcome {
        if let Err(e) = self.queue.release(delivery.receipt, delay).await {
            warn!(job_id = %delivery.job_id, error = %e, "failed to release delivery");
        }
        DeliveryOutcome::Released
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Spawn `count` workers sharing the deps. Each stops when `shutdown` fires.
pub fn spawn_workers(deps: &ServerDeps, count: usize, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
    let prefix = format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]);
    (0..count)
        .map(|i| {
            let config = JobWorkerConfig::for_lease(format!("{prefix}-{i}"), deps.settings.lease);
            let worker = JobWorker::new(deps.queue.clone(), PipelineCoordinator::from_deps(deps), config);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = worker.run(shutdown).await {
                    error!(error = %e, "worker exited with error");
                }
            })
        })
        .collect()
}
