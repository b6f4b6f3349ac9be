//! Job infrastructure for transcription execution.
//!
//! This module provides the kernel-level infrastructure for running jobs:
//! - [`TranscriptionJob`] - Job model, state DAG, claim and checkpoints
//! - [`JobStore`] - Atomic per-job storage (in-memory and Postgres)
//! - [`WorkQueue`] - At-least-once delivery of job ids (in-memory and Postgres)
//! - [`JobWorker`] - Long-running loop that claims and executes jobs
//! - [`StalledJobReaper`] - Re-enqueues abandoned jobs and purges expired ones
//!
//! # Architecture
//!
//! ```text
//! Gateway.submit()
//!     ├─► JobStore.put(job)              (state = queued)
//!     └─► WorkQueue.enqueue(job_id)
//!
//! JobWorker
//!     ├─► WorkQueue.dequeue()
//!     ├─► PipelineCoordinator.claim()    (JobStore.update, fenced)
//!     ├─► PipelineCoordinator.execute()  (stages, retries, budget)
//!     └─► WorkQueue.ack()
//!
//! StalledJobReaper
//!     ├─► JobStore.list_unfinished() + LivenessPolicy
//!     ├─► WorkQueue.enqueue(stalled)
//!     └─► JobStore.purge_expired()
//! ```
//!
//! Pipeline logic lives in `domains::transcription`; this module only provides
//! the infrastructure.

mod job;
mod memory_store;
mod postgres_queue;
mod postgres_store;
mod queue;
mod reaper;
mod store;
mod worker;

pub(crate) use job::to_chrono;
pub use job::{
    Claim, ErrorKind, JobError, JobInput, JobSnapshot, JobState, ModelSize, OutputFormat, Segment, Stage,
    StageArtifacts, TranscriptResult, TranscriptionJob,
};
pub use memory_store::InMemoryJobStore;
pub use postgres_queue::PostgresWorkQueue;
pub use postgres_store::PostgresJobStore;
pub use queue::{Delivery, InMemoryWorkQueue, WorkQueue};
pub use reaper::{LivenessPolicy, ReaperConfig, StalledJobReaper, SweepReport, UpdatedAtPolicy};
pub use store::{JobStore, Mutator, StoreError};
pub use worker::{spawn_workers, DeliveryOutcome, JobWorker, JobWorkerConfig};
