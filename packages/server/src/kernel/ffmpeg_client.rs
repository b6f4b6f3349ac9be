//! Audio extraction backed by the `ffmpeg` CLI.

use std::ffi::OsStr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::process::run_tool;
use super::traits::{AudioRef, BaseAudioExtractor, ExtractedAudio, FailureKind, MediaRef, StageContext, StageFailure};

/// Output sample rate expected by the transcriber.
pub const SAMPLE_RATE_HZ: u32 = 16_000;

#[derive(Debug, Clone)]
pub struct FfmpegConfig {
    pub binary: String,
    pub timeout: Duration,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

pub struct FfmpegAudioExtractor {
    config: FfmpegConfig,
}

impl FfmpegAudioExtractor {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BaseAudioExtractor for FfmpegAudioExtractor {
    async fn extract(&self, ctx: &StageContext, media: &MediaRef) -> Result<ExtractedAudio, StageFailure> {
        if tokio::fs::metadata(media.path()).await.is_err() {
            return Err(StageFailure::internal(format!(
                "downloaded media is missing: {}",
                media.path().display()
            )));
        }

        let target = ctx.work_dir.join("audio.wav");
        let sample_rate = SAMPLE_RATE_HZ.to_string();
        let args: Vec<&OsStr> = vec![
            OsStr::new("-hide_banner"),
            OsStr::new("-nostdin"),
            OsStr::new("-i"),
            media.path().as_os_str(),
            OsStr::new("-vn"),
            OsStr::new("-acodec"),
            OsStr::new("pcm_s16le"),
            OsStr::new("-ac"),
            OsStr::new("1"),
            OsStr::new("-ar"),
            OsStr::new(&sample_rate),
            OsStr::new("-y"),
            target.as_os_str(),
        ];

        let output = run_tool(&self.config.binary, args, &ctx.work_dir, self.config.timeout).await?;

        if !output.success() {
            let kind = classify_ffmpeg_error(&output.stderr);
            warn!(job_id = %ctx.job_id, exit_code = output.exit_code, %kind, "ffmpeg failed");
            return Err(StageFailure::new(
                kind,
                format!("audio extraction failed: {}", output.stderr_tail(3)),
            ));
        }

        info!(job_id = %ctx.job_id, path = %target.display(), "audio extracted");

        Ok(ExtractedAudio {
            audio_ref: AudioRef(target),
        })
    }
}

/// Failures on a local file are deterministic unless the host ran out of
/// resources.
pub fn classify_ffmpeg_error(stderr: &str) -> FailureKind {
    let s = stderr.to_lowercase();

    if s.contains("no space left on device")
        || s.contains("cannot allocate memory")
        || s.contains("resource temporarily unavailable")
    {
        FailureKind::TransientFailure
    } else {
        FailureKind::UnsupportedMedia
    }
}
