//! Server dependencies (using traits for testability)
//!
//! This module provides the central dependency container shared by the
//! gateway, the worker pool and the reaper. All external services sit behind
//! trait objects so tests can swap in the in-memory store and mock executors.

use std::sync::Arc;

use crate::config::{Config, PipelineSettings};
use crate::kernel::ffmpeg_client::FfmpegAudioExtractor;
use crate::kernel::jobs::{JobStore, WorkQueue};
use crate::kernel::traits::{BaseAudioExtractor, BaseDownloader, BaseTranscriber};
use crate::kernel::whisper_client::WhisperTranscriber;
use crate::kernel::ytdlp_client::YtDlpDownloader;

// =============================================================================
// StageExecutors
// =============================================================================

/// The three stage executors, one per pipeline stage.
#[derive(Clone)]
pub struct StageExecutors {
    pub downloader: Arc<dyn BaseDownloader>,
    pub extractor: Arc<dyn BaseAudioExtractor>,
    pub transcriber: Arc<dyn BaseTranscriber>,
}

impl StageExecutors {
    pub fn new(
        downloader: Arc<dyn BaseDownloader>,
        extractor: Arc<dyn BaseAudioExtractor>,
        transcriber: Arc<dyn BaseTranscriber>,
    ) -> Self {
        Self {
            downloader,
            extractor,
            transcriber,
        }
    }

    /// yt-dlp / ffmpeg / whisper CLIs configured from the environment.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(YtDlpDownloader::new(config.ytdlp_config())),
            Arc::new(FfmpegAudioExtractor::new(config.ffmpeg_config())),
            Arc::new(WhisperTranscriber::new(config.whisper_config())),
        )
    }
}

// =============================================================================
// ServerDeps
// =============================================================================

/// Server dependencies (using traits for testability)
#[derive(Clone)]
pub struct ServerDeps {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub executors: StageExecutors,
    pub settings: PipelineSettings,
}

impl ServerDeps {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        executors: StageExecutors,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            queue,
            executors,
            settings,
        }
    }
}
