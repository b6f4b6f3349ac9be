pub mod coordinator;
pub mod gateway;
pub mod retry;
pub mod subtitles;
pub mod validation;

// Re-export the pipeline surface
pub use coordinator::{ClaimOutcome, ClaimedJob, PipelineCoordinator};
pub use gateway::{GatewayError, JobGateway, SubmitRequest, SubmittedJob};
pub use retry::RetryPolicy;
pub use subtitles::{format_timestamp, render_srt};
