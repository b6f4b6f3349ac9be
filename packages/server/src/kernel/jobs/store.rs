//! Job store abstraction.
//!
//! The store is the single source of truth for job state. Every mutation goes
//! through [`JobStore::update`], which applies a closure to the current record
//! atomically with respect to other writers of the same job. Transition and
//! claim rules live on [`TranscriptionJob`]; the store only guarantees that a
//! closure sees the latest committed record and that its result is committed
//! whole or not at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::job::{JobState, TranscriptionJob};
use crate::common::JobId;

/// Mutation applied inside [`JobStore::update`]. Returning an error aborts
/// the write and leaves the stored record untouched.
pub type Mutator<'a> = Box<dyn FnOnce(&mut TranscriptionJob) -> Result<(), StoreError> + Send + 'a>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("Job is already claimed by {worker_id}")]
    AlreadyClaimed { worker_id: String },

    #[error("Job already finished ({0})")]
    Finished(JobState),

    #[error("Claim lost for job {0}")]
    ClaimLost(JobId),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    /// Errors that say nothing about the job itself, only about reaching the
    /// backing storage.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Internal(_))
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `AlreadyExists` if the id is taken.
    async fn put(&self, job: TranscriptionJob) -> Result<(), StoreError>;

    /// Fetch a job. Expired jobs read as `NotFound` even before purge.
    async fn get(&self, id: JobId) -> Result<TranscriptionJob, StoreError>;

    /// Atomically read-modify-write one job and return the committed record.
    ///
    /// The store stamps `updated_at` and refreshes retention (see
    /// [`TranscriptionJob::touch`]) after the mutator succeeds.
    async fn update(&self, id: JobId, mutate: Mutator<'_>) -> Result<TranscriptionJob, StoreError>;

    /// Non-terminal, unexpired jobs, oldest `updated_at` first.
    async fn list_unfinished(&self, limit: usize) -> Result<Vec<TranscriptionJob>, StoreError>;

    /// Physically remove expired records. Returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Cheap reachability probe for the health endpoint.
    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
