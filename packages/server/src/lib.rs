// Vidscribe - Transcription Job Orchestration
//
// This crate accepts video-to-text transcription jobs, persists them in a job
// store, and drives each one through download, audio extraction and
// transcription on a pool of workers.
//
// Pipeline logic lives in domains/transcription/; infrastructure in kernel/.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::*;
