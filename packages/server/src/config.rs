use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use typed_builder::TypedBuilder;

use crate::kernel::ffmpeg_client::FfmpegConfig;
use crate::kernel::jobs::ReaperConfig;
use crate::kernel::whisper_client::WhisperConfig;
use crate::kernel::ytdlp_client::YtDlpConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres URL. In-memory store and queue are used when unset.
    pub database_url: Option<String>,
    pub port: u16,
    pub worker_concurrency: usize,
    pub task_time_limit: Duration,
    pub result_expires: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub download_timeout: Duration,
    pub ffmpeg_timeout: Duration,
    pub max_video_duration_secs: u64,
    pub max_file_size: String,
    pub temp_dir: PathBuf,
    pub auto_cleanup: bool,
    pub whisper_device: String,
    pub whisper_model_cache_dir: Option<PathBuf>,
    pub allowed_video_domains: Vec<String>,
    pub ytdlp_bin: String,
    pub ffmpeg_bin: String,
    pub whisper_bin: String,
    pub cors_origins: Vec<String>,
    pub job_lease: Duration,
    pub stall_threshold: Duration,
    pub reaper_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            port: 8000,
            worker_concurrency: 2,
            task_time_limit: Duration::from_secs(3600),
            result_expires: Duration::from_secs(86_400),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(2000),
            download_timeout: Duration::from_secs(600),
            ffmpeg_timeout: Duration::from_secs(300),
            max_video_duration_secs: 7200,
            max_file_size: "500M".to_string(),
            temp_dir: PathBuf::from("/tmp/video_to_text"),
            auto_cleanup: true,
            whisper_device: "cpu".to_string(),
            whisper_model_cache_dir: None,
            allowed_video_domains: Vec::new(),
            ytdlp_bin: "yt-dlp".to_string(),
            ffmpeg_bin: "ffmpeg".to_string(),
            whisper_bin: "whisper".to_string(),
            cors_origins: vec!["*".to_string()],
            job_lease: Duration::from_secs(120),
            stall_threshold: Duration::from_secs(900),
            reaper_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();
        let config = Self {
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            port: parse_var("PORT", defaults.port)?,
            worker_concurrency: parse_var("WORKER_CONCURRENCY", defaults.worker_concurrency)?,
            task_time_limit: secs_var("TASK_TIME_LIMIT", defaults.task_time_limit)?,
            result_expires: secs_var("TASK_RESULT_EXPIRES", defaults.result_expires)?,
            max_retries: parse_var("MAX_RETRIES", defaults.max_retries)?,
            retry_base_delay: Duration::from_millis(parse_var(
                "RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay.as_millis() as u64,
            )?),
            download_timeout: secs_var("DOWNLOAD_TIMEOUT", defaults.download_timeout)?,
            ffmpeg_timeout: secs_var("FFMPEG_TIMEOUT", defaults.ffmpeg_timeout)?,
            max_video_duration_secs: parse_var("MAX_VIDEO_DURATION", defaults.max_video_duration_secs)?,
            max_file_size: env::var("MAX_FILE_SIZE").unwrap_or(defaults.max_file_size),
            temp_dir: env::var("TEMP_DIR").map(PathBuf::from).unwrap_or(defaults.temp_dir),
            auto_cleanup: flag_var("AUTO_CLEANUP", defaults.auto_cleanup),
            whisper_device: env::var("WHISPER_DEVICE")
                .map(|v| v.trim().to_lowercase())
                .unwrap_or(defaults.whisper_device),
            whisper_model_cache_dir: env::var("WHISPER_MODEL_CACHE_DIR").ok().map(PathBuf::from),
            allowed_video_domains: list_var("ALLOWED_VIDEO_DOMAINS").unwrap_or_default(),
            ytdlp_bin: env::var("YTDLP_BIN").unwrap_or(defaults.ytdlp_bin),
            ffmpeg_bin: env::var("FFMPEG_BIN").unwrap_or(defaults.ffmpeg_bin),
            whisper_bin: env::var("WHISPER_BIN").unwrap_or(defaults.whisper_bin),
            cors_origins: list_var("CORS_ORIGINS").unwrap_or(defaults.cors_origins),
            job_lease: secs_var("JOB_LEASE_SECS", defaults.job_lease)?,
            stall_threshold: secs_var("STALL_THRESHOLD_SECS", defaults.stall_threshold)?,
            reaper_interval: secs_var("REAPER_INTERVAL_SECS", defaults.reaper_interval)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("PORT must be between 1 and 65535");
        }
        if !matches!(self.whisper_device.as_str(), "cpu" | "cuda") {
            bail!("WHISPER_DEVICE must be 'cpu' or 'cuda', got '{}'", self.whisper_device);
        }
        if self.worker_concurrency == 0 {
            bail!("WORKER_CONCURRENCY must be at least 1");
        }
        if self.max_retries == 0 {
            bail!("MAX_RETRIES must be at least 1");
        }
        if self.job_lease >= self.task_time_limit {
            bail!("JOB_LEASE_SECS must be shorter than TASK_TIME_LIMIT");
        }
        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings::builder()
            .job_budget(self.task_time_limit)
            .retention(self.result_expires)
            .max_attempts(self.max_retries)
            .retry_base_delay(self.retry_base_delay)
            .lease(self.job_lease)
            .work_root(self.temp_dir.clone())
            .auto_cleanup(self.auto_cleanup)
            .allowed_domains(self.allowed_video_domains.clone())
            .build()
    }

    pub fn ytdlp_config(&self) -> YtDlpConfig {
        YtDlpConfig {
            binary: self.ytdlp_bin.clone(),
            max_filesize: self.max_file_size.clone(),
            max_duration_seconds: self.max_video_duration_secs,
            timeout: self.download_timeout,
        }
    }

    pub fn ffmpeg_config(&self) -> FfmpegConfig {
        FfmpegConfig {
            binary: self.ffmpeg_bin.clone(),
            timeout: self.ffmpeg_timeout,
        }
    }

    pub fn whisper_config(&self) -> WhisperConfig {
        WhisperConfig {
            binary: self.whisper_bin.clone(),
            device: self.whisper_device.clone(),
            model_dir: self.whisper_model_cache_dir.clone(),
            timeout: self.task_time_limit,
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            interval: self.reaper_interval,
            stall_threshold: self.stall_threshold,
            scan_limit: 500,
        }
    }
}

/// Knobs the pipeline core reads at runtime.
#[derive(Debug, Clone, TypedBuilder)]
pub struct PipelineSettings {
    /// Cumulative wall-clock budget per job, measured from first claim.
    #[builder(default = Duration::from_secs(3600))]
    pub job_budget: Duration,
    #[builder(default = Duration::from_secs(86_400))]
    pub retention: Duration,
    /// Attempts per stage, first try included.
    #[builder(default = 3)]
    pub max_attempts: u32,
    #[builder(default = Duration::from_millis(2000))]
    pub retry_base_delay: Duration,
    #[builder(default = Duration::from_secs(60))]
    pub retry_max_delay: Duration,
    #[builder(default = Duration::from_secs(120))]
    pub lease: Duration,
    #[builder(default = PathBuf::from("/tmp/video_to_text"))]
    pub work_root: PathBuf,
    #[builder(default = true)]
    pub auto_cleanup: bool,
    /// Empty allows every host.
    #[builder(default)]
    pub allowed_domains: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn parse_var<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid number")),
        Err(_) => Ok(default),
    }
}

fn secs_var(key: &str, default: Duration) -> Result<Duration> {
    parse_var(key, default.as_secs()).map(Duration::from_secs)
}

fn flag_var(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn list_var(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    Some(
        raw.split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
    )
}
