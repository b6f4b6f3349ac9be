// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no orchestration logic.
// Retry, timeouts and state bookkeeping belong to the pipeline coordinator.
//
// Naming convention: Base* for trait names (e.g., BaseDownloader, BaseTranscriber)

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::JobId;
use crate::kernel::jobs::{ModelSize, Segment};

// =============================================================================
// Artifact handles
// =============================================================================

/// Local handle to downloaded media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaRef(pub PathBuf);

/// Local handle to extracted mono 16 kHz audio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AudioRef(pub PathBuf);

impl MediaRef {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl AudioRef {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

/// Per-job execution context handed to every stage.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub job_id: JobId,
    /// Scratch directory owned by this job; removed when the job finishes.
    pub work_dir: PathBuf,
}

// =============================================================================
// Stage outputs
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedMedia {
    pub media_ref: MediaRef,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedAudio {
    pub audio_ref: AudioRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub text: String,
    pub segments: Vec<Segment>,
    pub detected_language: String,
}

// =============================================================================
// Stage failures
// =============================================================================

/// How an executor classifies its own failure. Timeouts are not listed: the
/// coordinator owns the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InvalidInput,
    TransientFailure,
    UnsupportedMedia,
    InternalError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::InvalidInput => "invalid input",
            FailureKind::TransientFailure => "transient failure",
            FailureKind::UnsupportedMedia => "unsupported media",
            FailureKind::InternalError => "internal error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidInput, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TransientFailure, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(FailureKind::UnsupportedMedia, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InternalError, message)
    }
}

// =============================================================================
// Stage executor traits
// =============================================================================

#[async_trait]
pub trait BaseDownloader: Send + Sync {
    /// Fetch media for a URL into the job's work dir.
    async fn fetch(&self, ctx: &StageContext, url: &str) -> Result<DownloadedMedia, StageFailure>;
}

#[async_trait]
pub trait BaseAudioExtractor: Send + Sync {
    /// Produce mono 16 kHz PCM audio from downloaded media.
    async fn extract(&self, ctx: &StageContext, media: &MediaRef) -> Result<ExtractedAudio, StageFailure>;
}

#[async_trait]
pub trait BaseTranscriber: Send + Sync {
    /// Turn speech into text. `language` of `None` means auto-detect.
    async fn transcribe(
        &self,
        ctx: &StageContext,
        audio: &AudioRef,
        language: Option<&str>,
        model: ModelSize,
    ) -> Result<Transcription, StageFailure>;
}
