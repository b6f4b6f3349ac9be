//! Kernel module - server infrastructure and dependencies.

pub mod deps;
pub mod ffmpeg_client;
pub mod jobs;
pub mod process;
pub mod test_dependencies;
pub mod traits;
pub mod whisper_client;
pub mod ytdlp_client;

// Stage executor clients
pub use ffmpeg_client::{FfmpegAudioExtractor, FfmpegConfig};
pub use whisper_client::{WhisperConfig, WhisperTranscriber};
pub use ytdlp_client::{YtDlpConfig, YtDlpDownloader};

// Other exports
pub use deps::{ServerDeps, StageExecutors};
pub use test_dependencies::TestDependencies;
pub use traits::*;
