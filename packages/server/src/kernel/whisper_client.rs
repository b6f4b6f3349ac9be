//! Transcriber backed by the `whisper` CLI.
//!
//! The CLI writes `<stem>.json` next to its other outputs; we read text,
//! segments and the detected language from there instead of scraping stdout.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::process::run_tool;
use super::traits::{AudioRef, BaseTranscriber, FailureKind, StageContext, StageFailure, Transcription};
use crate::kernel::jobs::{ModelSize, Segment};

#[derive(Debug, Clone)]
pub struct WhisperConfig {
    pub binary: String,
    /// "cpu" or "cuda".
    pub device: String,
    pub model_dir: Option<PathBuf>,
    /// Upper bound for one run; the job budget usually bites first.
    pub timeout: Duration,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            binary: "whisper".to_string(),
            device: "cpu".to_string(),
            model_dir: None,
            timeout: Duration::from_secs(3600),
        }
    }
}

pub struct WhisperTranscriber {
    config: WhisperConfig,
}

impl WhisperTranscriber {
    pub fn new(config: WhisperConfig) -> Self {
        Self { config }
    }
}

#[derive(Debug, Deserialize)]
struct WhisperOutput {
    text: String,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    start: f64,
    end: f64,
    text: String,
}

#[async_trait]
impl BaseTranscriber for WhisperTranscriber {
    async fn transcribe(
        &self,
        ctx: &StageContext,
        audio: &AudioRef,
        language: Option<&str>,
        model: ModelSize,
    ) -> Result<Transcription, StageFailure> {
        let output_dir = ctx.work_dir.join("transcript");
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|e| StageFailure::transient(format!("cannot create transcript dir: {e}")))?;

        let mut args: Vec<String> = vec![
            audio.path().to_string_lossy().into_owned(),
            "--model".to_string(),
            model.as_str().to_string(),
            "--device".to_string(),
            self.config.device.clone(),
            "--fp16".to_string(),
            "False".to_string(),
            "--task".to_string(),
            "transcribe".to_string(),
            "--output_format".to_string(),
            "json".to_string(),
            "--output_dir".to_string(),
            output_dir.to_string_lossy().into_owned(),
            "--verbose".to_string(),
            "False".to_string(),
        ];
        if let Some(dir) = &self.config.model_dir {
            args.push("--model_dir".to_string());
            args.push(dir.to_string_lossy().into_owned());
        }
        if let Some(language) = language {
            args.push("--language".to_string());
            args.push(language.to_string());
        }

        let output = run_tool(&self.config.binary, &args, &ctx.work_dir, self.config.timeout).await?;

        if !output.success() {
            let kind = classify_whisper_error(&output.stderr);
            warn!(job_id = %ctx.job_id, exit_code = output.exit_code, %kind, "whisper failed");
            return Err(StageFailure::new(
                kind,
                format!("transcription failed: {}", output.stderr_tail(3)),
            ));
        }

        let stem = audio
            .path()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        let json_path = output_dir.join(format!("{stem}.json"));
        let raw = tokio::fs::read_to_string(&json_path).await.map_err(|e| {
            StageFailure::internal(format!("whisper output {} unreadable: {e}", json_path.display()))
        })?;

        let transcription = parse_whisper_json(&raw, language)?;
        info!(
            job_id = %ctx.job_id,
            model = %model,
            language = %transcription.detected_language,
            segments = transcription.segments.len(),
            "transcription finished"
        );
        Ok(transcription)
    }
}

/// Convert whisper's JSON output. Falls back to the requested language when
/// the model does not report one.
pub fn parse_whisper_json(raw: &str, requested_language: Option<&str>) -> Result<Transcription, StageFailure> {
    let parsed: WhisperOutput = serde_json::from_str(raw)
        .map_err(|e| StageFailure::internal(format!("malformed whisper output: {e}")))?;

    let segments = parsed
        .segments
        .into_iter()
        .map(|s| Segment {
            start: s.start,
            end: s.end,
            text: s.text.trim().to_string(),
        })
        .collect();

    let detected_language = parsed
        .language
        .or_else(|| requested_language.map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());

    Ok(Transcription {
        text: parsed.text.trim().to_string(),
        segments,
        detected_language,
    })
}

pub fn classify_whisper_error(stderr: &str) -> FailureKind {
    let s = stderr.to_lowercase();

    if s.contains("out of memory") || s.contains("cuda error") {
        FailureKind::TransientFailure
    } else if s.contains("failed to load audio") {
        FailureKind::UnsupportedMedia
    } else {
        FailureKind::InternalError
    }
}
