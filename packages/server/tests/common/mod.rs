// Common test utilities
#![allow(dead_code)]

pub mod harness;

pub use harness::*;

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;
use vidscribe::common::JobId;
use vidscribe::config::PipelineSettings;
use vidscribe::domains::transcription::{JobGateway, PipelineCoordinator, SubmitRequest};
use vidscribe::kernel::jobs::{InMemoryJobStore, InMemoryWorkQueue, JobStore, TranscriptionJob};
use vidscribe::kernel::{ServerDeps, TestDependencies};

/// Initialize tracing once. Run with `RUST_LOG=debug cargo test -- --nocapture`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Settings with millisecond backoff and a private work root per test.
pub fn test_settings() -> PipelineSettings {
    PipelineSettings::builder()
        .job_budget(Duration::from_secs(30))
        .retry_base_delay(Duration::from_millis(5))
        .retry_max_delay(Duration::from_millis(20))
        .lease(Duration::from_secs(10))
        .work_root(std::env::temp_dir().join(format!("vidscribe-test-{}", Uuid::new_v4())))
        .build()
}

/// In-memory deployment wired to mock executors.
pub struct TestApp {
    pub deps: ServerDeps,
    pub mocks: TestDependencies,
    pub store: Arc<InMemoryJobStore>,
    pub queue: Arc<InMemoryWorkQueue>,
}

impl TestApp {
    pub fn new(mocks: TestDependencies) -> Self {
        Self::with_settings(mocks, test_settings())
    }

    pub fn with_settings(mocks: TestDependencies, settings: PipelineSettings) -> Self {
        init_tracing();
        let store = Arc::new(InMemoryJobStore::new(settings.retention));
        let queue = Arc::new(InMemoryWorkQueue::new());
        let deps = ServerDeps::new(store.clone(), queue.clone(), mocks.executors(), settings);
        Self {
            deps,
            mocks,
            store,
            queue,
        }
    }

    pub fn gateway(&self) -> JobGateway {
        JobGateway::from_deps(&self.deps)
    }

    pub fn coordinator(&self) -> PipelineCoordinator {
        PipelineCoordinator::from_deps(&self.deps)
    }

    /// Submit a job with default options.
    pub async fn submit(&self, url: &str) -> JobId {
        self.submit_request(SubmitRequest::new(url)).await
    }

    pub async fn submit_request(&self, request: SubmitRequest) -> JobId {
        self.gateway()
            .submit(request)
            .await
            .expect("submission should be accepted")
            .job_id
    }

    pub async fn job(&self, job_id: JobId) -> TranscriptionJob {
        self.store.get(job_id).await.expect("job should exist")
    }

    /// Poll the store until the job is terminal.
    pub async fn wait_for_terminal(&self, job_id: JobId, timeout: Duration) -> TranscriptionJob {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.job(job_id).await;
            if job.is_terminal() {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {job_id} still {} after {timeout:?}",
                job.state
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
