//! In-process job store for tests and single-node deployments without a
//! database.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::job::TranscriptionJob;
use super::store::{JobStore, Mutator, StoreError};
use crate::common::JobId;

pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, TranscriptionJob>>,
    retention: Duration,
}

impl InMemoryJobStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Number of records held, including expired ones not yet purged.
    pub async fn raw_len(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Overwrite a record as-is, bypassing transition rules. Test helper for
    /// staging stalled or expired jobs.
    pub async fn force(&self, job: TranscriptionJob) {
        self.jobs.write().await.insert(job.id, job);
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn put(&self, job: TranscriptionJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<TranscriptionJob, StoreError> {
        let jobs = self.jobs.read().await;
        jobs.get(&id)
            .filter(|job| !job.is_expired(Utc::now()))
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update(&self, id: JobId, mutate: Mutator<'_>) -> Result<TranscriptionJob, StoreError> {
        let mut jobs = self.jobs.write().await;
        let now = Utc::now();
        let current = jobs
            .get(&id)
            .filter(|job| !job.is_expired(now))
            .ok_or(StoreError::NotFound(id))?;

        // Mutate a copy so a rejected closure leaves no partial write behind.
        let mut next = current.clone();
        let was_terminal = next.is_terminal();
        mutate(&mut next)?;
        next.restore_immutable(current);
        next.touch(was_terminal, now, self.retention);

        jobs.insert(id, next.clone());
        Ok(next)
    }

    async fn list_unfinished(&self, limit: usize) -> Result<Vec<TranscriptionJob>, StoreError> {
        let jobs = self.jobs.read().await;
        let now = Utc::now();
        let mut unfinished: Vec<TranscriptionJob> = jobs
            .values()
            .filter(|job| !job.is_terminal() && !job.is_expired(now))
            .cloned()
            .collect();
        unfinished.sort_by_key(|job| job.updated_at);
        unfinished.truncate(limit);
        Ok(unfinished)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| !job.is_expired(now));
        Ok((before - jobs.len()) as u64)
    }
}
