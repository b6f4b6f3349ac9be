//! Transcription job model.
//!
//! A job carries its immutable input, its position in the fixed pipeline, and
//! the bookkeeping needed to run it safely from more than one worker: the
//! claim (lease + fencing token) and the per-stage checkpoints that let a
//! reclaimed job resume at its current stage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::store::StoreError;
use crate::common::JobId;
use crate::kernel::traits::{AudioRef, FailureKind, MediaRef};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "transcription_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Queued,
    Downloading,
    ExtractingAudio,
    Transcribing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Position along the happy path. `Failed` sits outside it.
    fn rank(&self) -> Option<u8> {
        match self {
            JobState::Queued => Some(0),
            JobState::Downloading => Some(1),
            JobState::ExtractingAudio => Some(2),
            JobState::Transcribing => Some(3),
            JobState::Completed => Some(4),
            JobState::Failed => None,
        }
    }

    /// Whether `next` is an edge of the state DAG.
    ///
    /// Happy-path states advance one step at a time; `Failed` is reachable
    /// from any non-terminal state; terminal states have no outgoing edges.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == JobState::Failed {
            return true;
        }
        match (self.rank(), next.rank()) {
            (Some(from), Some(to)) => to == from + 1,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Downloading => "downloading",
            JobState::ExtractingAudio => "extracting_audio",
            JobState::Transcribing => "transcribing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the three ordered pipeline steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    ExtractAudio,
    Transcribe,
}

impl Stage {
    /// Pipeline order.
    pub const ALL: [Stage; 3] = [Stage::Download, Stage::ExtractAudio, Stage::Transcribe];

    /// The job state that means "this stage is running".
    pub fn state(&self) -> JobState {
        match self {
            Stage::Download => JobState::Downloading,
            Stage::ExtractAudio => JobState::ExtractingAudio,
            Stage::Transcribe => JobState::Transcribing,
        }
    }

    pub fn from_state(state: JobState) -> Option<Stage> {
        match state {
            JobState::Downloading => Some(Stage::Download),
            JobState::ExtractingAudio => Some(Stage::ExtractAudio),
            JobState::Transcribing => Some(Stage::Transcribe),
            _ => None,
        }
    }

    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Download => Some(Stage::ExtractAudio),
            Stage::ExtractAudio => Some(Stage::Transcribe),
            Stage::Transcribe => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::ExtractAudio => "extract_audio",
            Stage::Transcribe => "transcribe",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    #[serde(alias = "txt")]
    Text,
    #[serde(alias = "srt")]
    Subtitle,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Text => "text",
            OutputFormat::Subtitle => "subtitle",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" | "txt" => Ok(OutputFormat::Text),
            "subtitle" | "srt" => Ok(OutputFormat::Subtitle),
            other => Err(format!("unsupported output format '{}'", other)),
        }
    }
}

/// Whisper model size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelSize {
    Tiny,
    Base,
    #[default]
    Small,
    Medium,
    Large,
}

impl ModelSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        }
    }
}

impl fmt::Display for ModelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            other => Err(format!("unsupported model size '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or unsupported URL or parameters - never retried
    InvalidInput,
    /// Network, timeout or resource exhaustion - retried within the stage
    TransientFailure,
    /// Too large, disallowed source, undecodable - never retried
    UnsupportedMedia,
    /// Cumulative job budget exceeded
    Timeout,
    /// Unexpected executor fault
    InternalError,
    /// Transient failures on every attempt up to the retry bound
    RetriesExhausted,
}

impl ErrorKind {
    /// Whether the coordinator may run the stage again.
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::TransientFailure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::TransientFailure => "transient_failure",
            ErrorKind::UnsupportedMedia => "unsupported_media",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InternalError => "internal_error",
            ErrorKind::RetriesExhausted => "retries_exhausted",
        }
    }
}

impl From<FailureKind> for ErrorKind {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::InvalidInput => ErrorKind::InvalidInput,
            FailureKind::TransientFailure => ErrorKind::TransientFailure,
            FailureKind::UnsupportedMedia => ErrorKind::UnsupportedMedia,
            FailureKind::InternalError => ErrorKind::InternalError,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Value types
// ============================================================================

/// Validated submission parameters. Immutable once the job exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInput {
    pub video_url: String,
    pub output_format: OutputFormat,
    /// ISO-639 code; `None` lets the model detect the language.
    pub language: Option<String>,
    pub model_size: ModelSize,
}

/// A time-aligned piece of transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptResult {
    pub format: OutputFormat,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<Segment>>,
    /// SRT document, present for subtitle output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    pub detected_language: String,
    pub source_duration_seconds: f64,
}

/// User-visible failure record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
}

/// Exclusive execution rights held by one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub worker_id: String,
    /// Fencing token: every coordinator write must present it.
    pub token: Uuid,
    pub claimed_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

impl Claim {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at > now
    }
}

/// Stage outputs checkpointed so a reclaimed job resumes where it stopped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageArtifacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_ref: Option<MediaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_ref: Option<AudioRef>,
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionJob {
    pub id: JobId,
    pub input: JobInput,

    // Pipeline position
    pub state: JobState,
    pub progress_label: Option<String>,

    // Terminal payloads (exactly one, only when terminal)
    pub result: Option<TranscriptResult>,
    pub error: Option<JobError>,

    // Execution bookkeeping
    pub artifacts: StageArtifacts,
    pub claim: Option<Claim>,
    pub started_at: Option<DateTime<Utc>>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TranscriptionJob {
    /// Create a freshly submitted job.
    pub fn queued(input: JobInput, retention: std::time::Duration) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            input,
            state: JobState::Queued,
            progress_label: Some("queued, waiting for a worker".to_string()),
            result: None,
            error: None,
            artifacts: StageArtifacts::default(),
            claim: None,
            started_at: None,
            created_at: now,
            updated_at: now,
            expires_at: now + to_chrono(retention),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Logically gone once `expires_at` has passed, whether or not the
    /// record has been purged yet.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn has_live_claim(&self, now: DateTime<Utc>) -> bool {
        self.claim.as_ref().is_some_and(|c| c.is_live(now))
    }

    /// Take exclusive execution rights.
    ///
    /// Fails when the job is terminal or another worker holds a live lease.
    /// An expired lease is taken over; the previous holder's token stops
    /// matching and its next write fails with `ClaimLost`.
    pub fn try_claim(
        &mut self,
        worker_id: &str,
        token: Uuid,
        lease: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.is_terminal() {
            return Err(StoreError::Finished(self.state));
        }
        if let Some(claim) = self.claim.as_ref().filter(|c| c.is_live(now)) {
            return Err(StoreError::AlreadyClaimed {
                worker_id: claim.worker_id.clone(),
            });
        }
        self.claim = Some(Claim {
            worker_id: worker_id.to_string(),
            token,
            claimed_at: now,
            lease_expires_at: now + to_chrono(lease),
        });
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        Ok(())
    }

    /// Reject writes from a worker that no longer holds the claim.
    pub fn ensure_claimed_by(&self, token: Uuid) -> Result<(), StoreError> {
        match &self.claim {
            Some(claim) if claim.token == token => Ok(()),
            _ => Err(StoreError::ClaimLost(self.id)),
        }
    }

    /// Heartbeat: push the lease forward.
    pub fn renew_lease(
        &mut self,
        token: Uuid,
        lease: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_claimed_by(token)?;
        if let Some(claim) = self.claim.as_mut() {
            claim.lease_expires_at = now + to_chrono(lease);
        }
        Ok(())
    }

    /// Give up the claim without finishing, so another worker can take the
    /// job right away instead of waiting out the lease.
    pub fn release_claim(&mut self, token: Uuid) -> Result<(), StoreError> {
        self.ensure_claimed_by(token)?;
        self.claim = None;
        Ok(())
    }

    /// Move into a stage. Re-entering the current stage (resume or retry)
    /// only refreshes the label.
    pub fn enter_stage(&mut self, stage: Stage, label: impl Into<String>) -> Result<(), StoreError> {
        if self.state != stage.state() {
            self.transition(stage.state())?;
        }
        self.progress_label = Some(label.into());
        Ok(())
    }

    pub fn set_progress(&mut self, label: impl Into<String>) -> Result<(), StoreError> {
        if self.is_terminal() {
            return Err(StoreError::Finished(self.state));
        }
        self.progress_label = Some(label.into());
        Ok(())
    }

    /// Terminal success. Releases the claim in the same write.
    pub fn complete(&mut self, result: TranscriptResult) -> Result<(), StoreError> {
        self.transition(JobState::Completed)?;
        self.progress_label = Some("completed".to_string());
        self.result = Some(result);
        self.error = None;
        self.claim = None;
        Ok(())
    }

    /// Terminal failure. Releases the claim in the same write.
    pub fn fail(&mut self, error: JobError) -> Result<(), StoreError> {
        self.transition(JobState::Failed)?;
        self.progress_label = Some(format!("failed during {}", error.stage));
        self.error = Some(error);
        self.result = None;
        self.claim = None;
        Ok(())
    }

    fn transition(&mut self, next: JobState) -> Result<(), StoreError> {
        if !self.state.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Stamp a write. Retention is refreshed by every write made while the
    /// job was still running (including the write that finishes it); once
    /// terminal the expiry stays fixed.
    pub fn touch(&mut self, was_terminal: bool, now: DateTime<Utc>, retention: std::time::Duration) {
        self.updated_at = now;
        if !was_terminal {
            self.expires_at = now + to_chrono(retention);
        }
    }

    /// Put back the fields fixed at submission, whatever a mutator did to them.
    pub fn restore_immutable(&mut self, original: &TranscriptionJob) {
        self.id = original.id;
        self.input = original.input.clone();
        self.created_at = original.created_at;
    }

    /// The caller-facing view.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id,
            state: self.state,
            progress_label: self.progress_label.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Read-only job record returned by status queries. Claim and checkpoint
/// data stay internal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TranscriptResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}
