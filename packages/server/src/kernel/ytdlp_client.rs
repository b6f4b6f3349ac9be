//! Downloader backed by the `yt-dlp` CLI.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::process::run_tool;
use super::traits::{BaseDownloader, DownloadedMedia, FailureKind, MediaRef, StageContext, StageFailure};

#[derive(Debug, Clone)]
pub struct YtDlpConfig {
    pub binary: String,
    /// Passed to `--max-filesize`, e.g. "500M".
    pub max_filesize: String,
    pub max_duration_seconds: u64,
    pub timeout: Duration,
}

impl Default for YtDlpConfig {
    fn default() -> Self {
        Self {
            binary: "yt-dlp".to_string(),
            max_filesize: "500M".to_string(),
            max_duration_seconds: 7200,
            timeout: Duration::from_secs(600),
        }
    }
}

pub struct YtDlpDownloader {
    config: YtDlpConfig,
}

impl YtDlpDownloader {
    pub fn new(config: YtDlpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BaseDownloader for YtDlpDownloader {
    async fn fetch(&self, ctx: &StageContext, url: &str) -> Result<DownloadedMedia, StageFailure> {
        let template = ctx.work_dir.join("source.%(ext)s");
        let args: Vec<String> = vec![
            "--no-playlist".to_string(),
            "--no-progress".to_string(),
            "--max-filesize".to_string(),
            self.config.max_filesize.clone(),
            "-f".to_string(),
            "bestaudio/best".to_string(),
            "-o".to_string(),
            template.to_string_lossy().into_owned(),
            "--print".to_string(),
            "after_move:%(duration)s\t%(filepath)s".to_string(),
            "--".to_string(),
            url.to_string(),
        ];

        let output = run_tool(&self.config.binary, &args, &ctx.work_dir, self.config.timeout).await?;

        if !output.success() {
            let detail = output.stderr_tail(3);
            let kind = classify_download_error(&output.stderr);
            warn!(job_id = %ctx.job_id, exit_code = output.exit_code, %kind, "yt-dlp failed");
            return Err(StageFailure::new(kind, format!("download failed: {detail}")));
        }

        let combined = format!("{}\n{}", output.stdout, output.stderr);
        if combined.contains("larger than max-filesize") {
            return Err(StageFailure::unsupported(format!(
                "media exceeds the {} size limit",
                self.config.max_filesize
            )));
        }

        let (duration_seconds, path) = parse_print_line(&output.stdout).ok_or_else(|| {
            StageFailure::internal("yt-dlp finished without reporting a downloaded file")
        })?;

        if duration_seconds > self.config.max_duration_seconds as f64 {
            // Not worth keeping around; the job is going to fail.
            let _ = tokio::fs::remove_file(&path).await;
            return Err(StageFailure::unsupported(format!(
                "video is {:.0}s long, limit is {}s",
                duration_seconds, self.config.max_duration_seconds
            )));
        }

        info!(job_id = %ctx.job_id, duration_seconds, path = %path.display(), "media downloaded");

        Ok(DownloadedMedia {
            media_ref: MediaRef(path),
            duration_seconds,
        })
    }
}

/// Parse the `duration<TAB>filepath` line printed after the file is moved
/// into place. Live streams report no duration; those read as 0.
fn parse_print_line(stdout: &str) -> Option<(f64, PathBuf)> {
    let line = stdout.lines().rev().find(|l| l.contains('\t'))?;
    let (duration, path) = line.split_once('\t')?;
    let path = path.trim();
    if path.is_empty() || path == "NA" {
        return None;
    }
    let duration = duration.trim().parse::<f64>().unwrap_or(0.0);
    Some((duration, PathBuf::from(path)))
}

/// Map yt-dlp stderr to a failure kind. Unknown errors are assumed to be
/// network trouble and retried.
pub fn classify_download_error(stderr: &str) -> FailureKind {
    let s = stderr.to_lowercase();

    const INVALID: &[&str] = &["unsupported url", "is not a valid url", "no video formats found"];
    const UNSUPPORTED: &[&str] = &[
        "video unavailable",
        "private video",
        "this video is not available",
        "members-only",
        "sign in to confirm your age",
        "larger than max-filesize",
        "requested format is not available",
        "drm protected",
    ];

    if INVALID.iter().any(|p| s.contains(p)) {
        FailureKind::InvalidInput
    } else if UNSUPPORTED.iter().any(|p| s.contains(p)) {
        FailureKind::UnsupportedMedia
    } else {
        FailureKind::TransientFailure
    }
}
