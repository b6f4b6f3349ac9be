// Business domains
pub mod transcription;
