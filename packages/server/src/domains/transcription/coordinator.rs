//! Pipeline coordinator.
//!
//! Drives one claimed job through download, audio extraction and
//! transcription. The coordinator is the only writer of job state once a job
//! is claimed, and every write it makes is fenced on the claim token: a
//! worker that lost its claim to another worker fails its next write with
//! [`StoreError::ClaimLost`] and stops.
//!
//! ```text
//! claim ──► enter stage ──► invoke executor ──ok──► checkpoint + next stage ──► ... ──► complete
//!                │               │
//!                │               ├─transient, attempts left──► label "retrying", backoff, invoke again
//!                │               └─otherwise───────────────────► fail {stage, kind, message}
//!                └─ cumulative budget elapsed (any point) ─────► fail {kind: timeout}
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::retry::RetryPolicy;
use super::subtitles::render_srt;
use crate::common::JobId;
use crate::config::PipelineSettings;
use crate::kernel::deps::{ServerDeps, StageExecutors};
use crate::kernel::jobs::{
    ErrorKind, JobError, JobInput, JobState, JobStore, OutputFormat, Stage, StoreError, TranscriptResult,
    TranscriptionJob,
};
use crate::kernel::traits::{DownloadedMedia, ExtractedAudio, StageContext, StageFailure, Transcription};

/// Result of trying to take a job.
#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(ClaimedJob),
    /// Another worker holds a live lease.
    AlreadyClaimed { worker_id: String },
    /// Nothing left to do.
    Finished(JobState),
    /// Unknown or expired id.
    Missing,
}

/// A job plus the fencing token that authorises writes to it.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: TranscriptionJob,
    pub token: Uuid,
}

impl ClaimedJob {
    pub fn id(&self) -> JobId {
        self.job.id
    }
}

enum StageOutput {
    Downloaded(DownloadedMedia),
    Extracted(ExtractedAudio),
    Transcribed(Transcription),
}

/// Where execution is, readable after the pipeline future is dropped.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    stage: Stage,
    attempt: u32,
}

#[derive(Clone)]
pub struct PipelineCoordinator {
    store: Arc<dyn JobStore>,
    executors: StageExecutors,
    settings: PipelineSettings,
    retry: RetryPolicy,
}

impl PipelineCoordinator {
    pub fn new(store: Arc<dyn JobStore>, executors: StageExecutors, settings: PipelineSettings) -> Self {
        let retry = RetryPolicy::from_settings(&settings);
        Self {
            store,
            executors,
            settings,
            retry,
        }
    }

    pub fn from_deps(deps: &ServerDeps) -> Self {
        Self::new(deps.store.clone(), deps.executors.clone(), deps.settings.clone())
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Take exclusive execution rights. Of two concurrent claims on the same
    /// job exactly one returns `Claimed`.
    pub async fn claim(&self, job_id: JobId, worker_id: &str) -> Result<ClaimOutcome, StoreError> {
        let token = Uuid::new_v4();
        let lease = self.settings.lease;
        let worker = worker_id.to_string();

        let outcome = self
            .store
            .update(
                job_id,
                Box::new(move |job| job.try_claim(&worker, token, lease, Utc::now())),
            )
            .await;

        match outcome {
            Ok(job) => {
                debug!(job_id = %job_id, worker_id, state = %job.state, "job claimed");
                Ok(ClaimOutcome::Claimed(ClaimedJob { job, token }))
            }
            Err(StoreError::AlreadyClaimed { worker_id }) => Ok(ClaimOutcome::AlreadyClaimed { worker_id }),
            Err(StoreError::Finished(state)) => Ok(ClaimOutcome::Finished(state)),
            Err(StoreError::NotFound(_)) => Ok(ClaimOutcome::Missing),
            Err(e) => Err(e),
        }
    }

    /// Extend the claim lease.
    pub async fn heartbeat(&self, job_id: JobId, token: Uuid) -> Result<(), StoreError> {
        let lease = self.settings.lease;
        self.store
            .update(job_id, Box::new(move |job| job.renew_lease(token, lease, Utc::now())))
            .await
            .map(|_| ())
    }

    /// Hand the job back unfinished (worker shutdown).
    pub async fn release(&self, job_id: JobId, token: Uuid) -> Result<(), StoreError> {
        self.store
            .update(job_id, Box::new(move |job| job.release_claim(token)))
            .await
            .map(|_| ())
    }

    /// Claim then execute. `Ok(None)` when the job was not ours to run.
    pub async fn run(&self, job_id: JobId, worker_id: &str) -> Result<Option<TranscriptionJob>, StoreError> {
        match self.claim(job_id, worker_id).await? {
            ClaimOutcome::Claimed(claimed) => self.execute(claimed).await.map(Some),
            _ => Ok(None),
        }
    }

    /// Run a claimed job to a terminal state and return the terminal record.
    ///
    /// Resumes at the job's current stage. Stages that already succeeded are
    /// never re-run; their outputs come from the checkpoint.
    pub async fn execute(&self, claimed: ClaimedJob) -> Result<TranscriptionJob, StoreError> {
        let ClaimedJob { job, token } = claimed;
        let job_id = job.id;
        let budget = self.settings.job_budget;

        let mut cursor = Cursor {
            stage: Stage::from_state(job.state).unwrap_or(Stage::Download),
            attempt: 0,
        };

        let started_at = job.started_at.unwrap_or_else(Utc::now);
        let elapsed = (Utc::now() - started_at).to_std().unwrap_or(Duration::ZERO);
        let Some(remaining) = budget.checked_sub(elapsed).filter(|r| !r.is_zero()) else {
            warn!(job_id = %job_id, stage = %cursor.stage, "time budget already spent");
            return self.fail_on_timeout(job_id, token, cursor).await;
        };

        let ctx = StageContext {
            job_id,
            work_dir: self.settings.work_root.join(job_id.to_string()),
        };
        if let Err(e) = tokio::fs::create_dir_all(&ctx.work_dir).await {
            let error = JobError {
                stage: cursor.stage,
                kind: ErrorKind::InternalError,
                message: format!("cannot prepare working directory: {e}"),
                attempts: 0,
            };
            error!(job_id = %job_id, error = %e, "failed to create work dir");
            return self.write(job_id, token, move |j| j.fail(error)).await;
        }

        info!(job_id = %job_id, stage = %cursor.stage, remaining_secs = remaining.as_secs(), "executing job");

        let deadline = Instant::now() + remaining;
        let outcome = tokio::time::timeout_at(deadline, self.drive(job, token, &ctx, &mut cursor)).await;

        let finished = match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    job_id = %job_id,
                    stage = %cursor.stage,
                    attempt = cursor.attempt,
                    budget_secs = budget.as_secs(),
                    "job exceeded its time budget"
                );
                self.fail_on_timeout(job_id, token, cursor).await
            }
        };

        if let Ok(job) = &finished {
            if job.is_terminal() {
                self.cleanup(&ctx).await;
            }
        }
        finished
    }

    /// Fail a claimed job from outside the pipeline (e.g. an executor panic).
    pub async fn abort(
        &self,
        job_id: JobId,
        token: Uuid,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Result<TranscriptionJob, StoreError> {
        let message = message.into();
        let job = self
            .write(job_id, token, move |j| {
                let stage = Stage::from_state(j.state).unwrap_or(Stage::Download);
                j.fail(JobError {
                    stage,
                    kind,
                    message,
                    attempts: 1,
                })
            })
            .await?;
        self.cleanup(&StageContext {
            job_id,
            work_dir: self.settings.work_root.join(job_id.to_string()),
        })
        .await;
        Ok(job)
    }

    async fn drive(
        &self,
        job: TranscriptionJob,
        token: Uuid,
        ctx: &StageContext,
        cursor: &mut Cursor,
    ) -> Result<TranscriptionJob, StoreError> {
        let job_id = job.id;
        let mut stage = cursor.stage;
        let label = stage_label(stage, &job.input);
        let mut job = self.write(job_id, token, move |j| j.enter_stage(stage, label)).await?;

        loop {
            cursor.stage = stage;
            cursor.attempt = 0;

            let output = match self.run_with_retry(&job, token, ctx, stage, cursor).await? {
                Ok(output) => output,
                Err(error) => {
                    warn!(
                        job_id = %job_id,
                        stage = %error.stage,
                        kind = %error.kind,
                        attempts = error.attempts,
                        "job failed"
                    );
                    return self.write(job_id, token, move |j| j.fail(error)).await;
                }
            };

            match (stage.next(), output) {
                (Some(next), output) => {
                    let label = stage_label(next, &job.input);
                    job = self
                        .write(job_id, token, move |j| {
                            checkpoint(j, output);
                            j.enter_stage(next, label)
                        })
                        .await?;
                    debug!(job_id = %job_id, from = %stage, to = %next, "stage succeeded");
                    stage = next;
                }
                (None, StageOutput::Transcribed(transcription)) => {
                    let duration = job.artifacts.duration_seconds.unwrap_or(0.0);
                    let result = build_result(job.input.output_format, transcription, duration);
                    let done = self.write(job_id, token, move |j| j.complete(result)).await?;
                    info!(job_id = %job_id, "job completed");
                    return Ok(done);
                }
                (None, _) => {
                    let error = JobError {
                        stage,
                        kind: ErrorKind::InternalError,
                        message: "final stage produced no transcript".to_string(),
                        attempts: cursor.attempt,
                    };
                    return self.write(job_id, token, move |j| j.fail(error)).await;
                }
            }
        }
    }

    /// Invoke one stage, retrying transient failures within the bound.
    /// The outer `Result` carries store errors; the inner one the stage verdict.
    async fn run_with_retry(
        &self,
        job: &TranscriptionJob,
        token: Uuid,
        ctx: &StageContext,
        stage: Stage,
        cursor: &mut Cursor,
    ) -> Result<Result<StageOutput, JobError>, StoreError> {
        let mut attempt = 1;
        loop {
            cursor.attempt = attempt;
            let failure = match self.invoke(stage, job, ctx).await {
                Ok(output) => return Ok(Ok(output)),
                Err(failure) => failure,
            };

            let kind = ErrorKind::from(failure.kind);
            if kind.should_retry() && self.retry.allows_retry_after(attempt) {
                let delay = self.retry.delay_after(attempt);
                warn!(
                    job_id = %job.id,
                    stage = %stage,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure.message,
                    "transient stage failure, retrying"
                );
                let label = retry_label(stage, attempt + 1, self.retry.max_attempts);
                self.write(job.id, token, move |j| j.set_progress(label)).await?;
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            let error = match kind {
                ErrorKind::TransientFailure => JobError {
                    stage,
                    kind: ErrorKind::RetriesExhausted,
                    message: format!("{} (gave up after {} attempts)", failure.message, attempt),
                    attempts: attempt,
                },
                ErrorKind::InternalError => {
                    error!(job_id = %job.id, stage = %stage, error = %failure.message, "executor internal error");
                    JobError {
                        stage,
                        kind,
                        message: failure.message,
                        attempts: attempt,
                    }
                }
                _ => JobError {
                    stage,
                    kind,
                    message: failure.message,
                    attempts: attempt,
                },
            };
            return Ok(Err(error));
        }
    }

    async fn invoke(
        &self,
        stage: Stage,
        job: &TranscriptionJob,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageFailure> {
        match stage {
            Stage::Download => self
                .executors
                .downloader
                .fetch(ctx, &job.input.video_url)
                .await
                .map(StageOutput::Downloaded),
            Stage::ExtractAudio => {
                let media = job
                    .artifacts
                    .media_ref
                    .as_ref()
                    .ok_or_else(|| StageFailure::internal("no downloaded media checkpoint to resume from"))?;
                self.executors
                    .extractor
                    .extract(ctx, media)
                    .await
                    .map(StageOutput::Extracted)
            }
            Stage::Transcribe => {
                let audio = job
                    .artifacts
                    .audio_ref
                    .as_ref()
                    .ok_or_else(|| StageFailure::internal("no extracted audio checkpoint to resume from"))?;
                self.executors
                    .transcriber
                    .transcribe(ctx, audio, job.input.language.as_deref(), job.input.model_size)
                    .await
                    .map(StageOutput::Transcribed)
            }
        }
    }

    async fn fail_on_timeout(
        &self,
        job_id: JobId,
        token: Uuid,
        cursor: Cursor,
    ) -> Result<TranscriptionJob, StoreError> {
        let error = JobError {
            stage: cursor.stage,
            kind: ErrorKind::Timeout,
            message: format!(
                "job exceeded its {}s time budget",
                self.settings.job_budget.as_secs()
            ),
            attempts: cursor.attempt,
        };
        match self.write(job_id, token, move |j| j.fail(error)).await {
            // The pipeline finished in the same instant the budget ran out;
            // the terminal write already dropped our claim.
            Err(e @ (StoreError::InvalidTransition { .. } | StoreError::ClaimLost(_))) => {
                match self.store.get(job_id).await {
                    Ok(job) if job.is_terminal() => Ok(job),
                    _ => Err(e),
                }
            }
            other => other,
        }
    }

    /// Fenced write: rejected unless the job is still claimed with `token`.
    async fn write<'a, F>(&'a self, job_id: JobId, token: Uuid, mutate: F) -> Result<TranscriptionJob, StoreError>
    where
        F: FnOnce(&mut TranscriptionJob) -> Result<(), StoreError> + Send + 'a,
    {
        self.store
            .update(
                job_id,
                Box::new(move |job| {
                    job.ensure_claimed_by(token)?;
                    mutate(job)
                }),
            )
            .await
    }

    async fn cleanup(&self, ctx: &StageContext) {
        if !self.settings.auto_cleanup {
            return;
        }
        match tokio::fs::remove_dir_all(&ctx.work_dir).await {
            Ok(()) => debug!(job_id = %ctx.job_id, "work dir removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(job_id = %ctx.job_id, error = %e, "failed to remove work dir"),
        }
    }
}

fn checkpoint(job: &mut TranscriptionJob, output: StageOutput) {
    match output {
        StageOutput::Downloaded(media) => {
            job.artifacts.media_ref = Some(media.media_ref);
            job.artifacts.duration_seconds = Some(media.duration_seconds);
        }
        StageOutput::Extracted(audio) => {
            job.artifacts.audio_ref = Some(audio.audio_ref);
        }
        StageOutput::Transcribed(_) => {}
    }
}

fn build_result(format: OutputFormat, transcription: Transcription, duration: f64) -> TranscriptResult {
    let Transcription {
        text,
        segments,
        detected_language,
    } = transcription;

    match format {
        OutputFormat::Text => TranscriptResult {
            format,
            text: text.trim().to_string(),
            segments: None,
            subtitle: None,
            detected_language,
            source_duration_seconds: duration,
        },
        OutputFormat::Subtitle => TranscriptResult {
            format,
            text: text.trim().to_string(),
            subtitle: Some(render_srt(&segments)),
            segments: Some(segments),
            detected_language,
            source_duration_seconds: duration,
        },
    }
}

fn stage_label(stage: Stage, input: &JobInput) -> String {
    match stage {
        Stage::Download => "downloading video".to_string(),
        Stage::ExtractAudio => "extracting audio".to_string(),
        Stage::Transcribe => format!("transcribing with whisper ({})", input.model_size),
    }
}

fn retry_label(stage: Stage, next_attempt: u32, max_attempts: u32) -> String {
    let what = match stage {
        Stage::Download => "download",
        Stage::ExtractAudio => "audio extraction",
        Stage::Transcribe => "transcription",
    };
    format!("retrying {what} (attempt {next_attempt} of {max_attempts})")
}
