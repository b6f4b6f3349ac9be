//! Job submission and query gateway.
//!
//! `submit` validates input, creates the job in `Queued` and enqueues its id;
//! `query` is a read-only snapshot. Neither waits on pipeline progress.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use super::validation::{normalize_language, parse_model_size, parse_output_format, validate_video_url, FieldError};
use crate::common::JobId;
use crate::config::PipelineSettings;
use crate::kernel::deps::ServerDeps;
use crate::kernel::jobs::{JobInput, JobSnapshot, JobState, JobStore, StoreError, TranscriptionJob, WorkQueue};

/// Raw submission as received from a caller. Enumerated fields stay strings
/// so validation can report which field was wrong.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub video_url: String,
    pub output_format: Option<String>,
    pub language: Option<String>,
    pub model_size: Option<String>,
}

impl SubmitRequest {
    pub fn new(video_url: impl Into<String>) -> Self {
        Self {
            video_url: video_url.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmittedJob {
    pub job_id: JobId,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<FieldError> for GatewayError {
    fn from(e: FieldError) -> Self {
        GatewayError::InvalidInput {
            field: e.field,
            reason: e.reason,
        }
    }
}

#[derive(Clone)]
pub struct JobGateway {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    settings: PipelineSettings,
}

impl JobGateway {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn WorkQueue>, settings: PipelineSettings) -> Self {
        Self { store, queue, settings }
    }

    pub fn from_deps(deps: &ServerDeps) -> Self {
        Self::new(deps.store.clone(), deps.queue.clone(), deps.settings.clone())
    }

    /// Validate and enqueue a job. Invalid input creates no record.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmittedJob, GatewayError> {
        let input = self.validate(&request)?;
        let job = TranscriptionJob::queued(input, self.settings.retention);
        let submitted = SubmittedJob {
            job_id: job.id,
            state: job.state,
            created_at: job.created_at,
        };

        self.store.put(job).await?;

        // The record is the source of truth; a job whose enqueue failed is
        // picked up by the stalled-job reaper.
        if let Err(e) = self.queue.enqueue(submitted.job_id).await {
            warn!(job_id = %submitted.job_id, error = %e, "failed to enqueue job, leaving it to the reaper");
        }

        info!(job_id = %submitted.job_id, "job submitted");
        Ok(submitted)
    }

    /// Read a job. Malformed, unknown and expired ids are all `NotFound`.
    pub async fn query(&self, job_id: &str) -> Result<JobSnapshot, GatewayError> {
        let id = JobId::parse(job_id.trim()).map_err(|_| GatewayError::NotFound(job_id.to_string()))?;
        match self.store.get(id).await {
            Ok(job) => Ok(job.snapshot()),
            Err(StoreError::NotFound(_)) => Err(GatewayError::NotFound(job_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn validate(&self, request: &SubmitRequest) -> Result<JobInput, GatewayError> {
        Ok(JobInput {
            video_url: validate_video_url(&request.video_url, &self.settings.allowed_domains)?,
            output_format: parse_output_format(request.output_format.as_deref())?,
            language: normalize_language(request.language.as_deref())?,
            model_size: parse_model_size(request.model_size.as_deref())?,
        })
    }
}
