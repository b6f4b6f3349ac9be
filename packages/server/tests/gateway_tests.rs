//! Submission and query gateway tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::common::{test_settings, TestApp};
use vidscribe::common::JobId;
use vidscribe::config::PipelineSettings;
use vidscribe::domains::transcription::{GatewayError, JobGateway, SubmitRequest};
use vidscribe::kernel::jobs::{
    Delivery, InMemoryJobStore, JobState, JobStore, ModelSize, OutputFormat, ReaperConfig, StalledJobReaper,
    WorkQueue,
};
use vidscribe::kernel::TestDependencies;

fn invalid_field(result: Result<impl std::fmt::Debug, GatewayError>) -> &'static str {
    match result {
        Err(GatewayError::InvalidInput { field, .. }) => field,
        other => panic!("expected invalid input, got {other:?}"),
    }
}

// ============================================================================
// Submit
// ============================================================================

#[tokio::test]
async fn submitted_job_is_immediately_queryable_as_queued() {
    let app = TestApp::new(TestDependencies::new());
    let gateway = app.gateway();

    let submitted = gateway
        .submit(SubmitRequest::new("https://video.example/watch?v=1"))
        .await
        .unwrap();
    assert_eq!(submitted.state, JobState::Queued);

    let snapshot = gateway.query(&submitted.job_id.to_string()).await.unwrap();
    assert_eq!(snapshot.job_id, submitted.job_id);
    assert_eq!(snapshot.state, JobState::Queued);
    assert!(snapshot.progress_label.is_some());
    assert!(snapshot.result.is_none());
    assert!(snapshot.error.is_none());
    assert_eq!(snapshot.created_at, submitted.created_at);

    assert_eq!(app.queue.pending().await.unwrap(), 1);
}

#[tokio::test]
async fn every_submission_gets_a_distinct_id() {
    let app = TestApp::new(TestDependencies::new());
    let first = app.submit("https://video.example/same").await;
    let second = app.submit("https://video.example/same").await;

    assert_ne!(first, second);
    assert_eq!(app.store.raw_len().await, 2);
}

#[tokio::test]
async fn defaults_and_normalisation_are_applied() {
    let app = TestApp::new(TestDependencies::new());

    let job_id = app.submit("  https://video.example/trimmed  ").await;
    let input = app.job(job_id).await.input;
    assert_eq!(input.video_url, "https://video.example/trimmed");
    assert_eq!(input.output_format, OutputFormat::Text);
    assert_eq!(input.model_size, ModelSize::Small);
    assert_eq!(input.language, None);

    let job_id = app
        .submit_request(SubmitRequest {
            video_url: "https://video.example/regional".to_string(),
            output_format: Some("TXT".to_string()),
            language: Some("en-US".to_string()),
            model_size: Some("tiny".to_string()),
        })
        .await;
    let input = app.job(job_id).await.input;
    assert_eq!(input.language.as_deref(), Some("en"));
    assert_eq!(input.model_size, ModelSize::Tiny);

    let mut auto = SubmitRequest::new("https://video.example/auto");
    auto.language = Some("auto".to_string());
    let job_id = app.submit_request(auto).await;
    assert_eq!(app.job(job_id).await.input.language, None);
}

#[tokio::test]
async fn invalid_input_creates_no_record() {
    let app = TestApp::new(TestDependencies::new());
    let gateway = app.gateway();

    assert_eq!(invalid_field(gateway.submit(SubmitRequest::new("")).await), "video_url");
    assert_eq!(invalid_field(gateway.submit(SubmitRequest::new("   ")).await), "video_url");
    assert_eq!(
        invalid_field(gateway.submit(SubmitRequest::new("ftp://video.example/a")).await),
        "video_url"
    );
    assert_eq!(
        invalid_field(gateway.submit(SubmitRequest::new("https://video.example/a;rm -rf /")).await),
        "video_url"
    );

    let mut bad_format = SubmitRequest::new("https://video.example/a");
    bad_format.output_format = Some("pdf".to_string());
    assert_eq!(invalid_field(gateway.submit(bad_format).await), "output_format");

    let mut bad_model = SubmitRequest::new("https://video.example/a");
    bad_model.model_size = Some("huge".to_string());
    assert_eq!(invalid_field(gateway.submit(bad_model).await), "model_size");

    let mut bad_language = SubmitRequest::new("https://video.example/a");
    bad_language.language = Some("english".to_string());
    assert_eq!(invalid_field(gateway.submit(bad_language).await), "language");

    assert_eq!(app.store.raw_len().await, 0);
    assert_eq!(app.queue.pending().await.unwrap(), 0);
}

#[tokio::test]
async fn allow_list_restricts_hosts_to_listed_domains() {
    let settings = PipelineSettings {
        allowed_domains: vec!["youtube.com".to_string()],
        ..test_settings()
    };
    let app = TestApp::with_settings(TestDependencies::new(), settings);
    let gateway = app.gateway();

    assert!(gateway
        .submit(SubmitRequest::new("https://www.youtube.com/watch?v=x"))
        .await
        .is_ok());
    assert!(gateway.submit(SubmitRequest::new("https://youtube.com/watch?v=y")).await.is_ok());
    assert_eq!(
        invalid_field(gateway.submit(SubmitRequest::new("https://notyoutube.com/watch?v=z")).await),
        "video_url"
    );
}

// ============================================================================
// Query
// ============================================================================

#[tokio::test]
async fn unknown_and_malformed_ids_are_not_found() {
    let app = TestApp::new(TestDependencies::new());
    let gateway = app.gateway();

    assert!(matches!(
        gateway.query(&JobId::new().to_string()).await,
        Err(GatewayError::NotFound(_))
    ));
    assert!(matches!(gateway.query("not-a-job-id").await, Err(GatewayError::NotFound(_))));
    assert!(matches!(gateway.query("").await, Err(GatewayError::NotFound(_))));
}

#[tokio::test]
async fn expired_job_is_not_found_even_before_purge() {
    let app = TestApp::new(TestDependencies::new());
    let job_id = app.submit("https://video.example/old").await;

    let mut job = app.job(job_id).await;
    job.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
    app.store.force(job).await;

    assert!(matches!(
        app.gateway().query(&job_id.to_string()).await,
        Err(GatewayError::NotFound(_))
    ));
    assert_eq!(app.store.raw_len().await, 1);
}

#[tokio::test]
async fn completed_job_snapshot_carries_the_result() {
    let app = TestApp::new(TestDependencies::new());
    let job_id = app.submit("https://video.example/done").await;
    app.coordinator().run(job_id, "worker-1").await.unwrap().unwrap();

    let snapshot = app.gateway().query(&job_id.to_string()).await.unwrap();

    assert_eq!(snapshot.state, JobState::Completed);
    assert_eq!(snapshot.result.unwrap().text, "Hello world. This is a test.");
    assert!(snapshot.error.is_none());
    assert!(snapshot.updated_at >= snapshot.created_at);
}

// ============================================================================
// Enqueue failure
// ============================================================================

/// Queue that accepts nothing.
struct BrokenQueue;

#[async_trait]
impl WorkQueue for BrokenQueue {
    async fn enqueue(&self, _job_id: JobId) -> Result<()> {
        Err(anyhow!("queue unavailable"))
    }

    async fn dequeue(&self, _worker_id: &str, _visibility: Duration) -> Result<Option<Delivery>> {
        Err(anyhow!("queue unavailable"))
    }

    async fn extend(&self, _receipt: Uuid, _visibility: Duration) -> Result<bool> {
        Ok(false)
    }

    async fn ack(&self, _receipt: Uuid) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _receipt: Uuid, _delay: Duration) -> Result<()> {
        Ok(())
    }

    async fn pending(&self) -> Result<usize> {
        Ok(0)
    }
}

#[tokio::test]
async fn job_survives_a_failed_enqueue_and_is_recovered_by_the_reaper() {
    common::init_tracing();
    let settings = test_settings();
    let store = Arc::new(InMemoryJobStore::new(settings.retention));
    let gateway = JobGateway::new(store.clone(), Arc::new(BrokenQueue), settings);

    let submitted = gateway
        .submit(SubmitRequest::new("https://video.example/lost"))
        .await
        .expect("record is written even when the queue is down");
    assert_eq!(
        gateway.query(&submitted.job_id.to_string()).await.unwrap().state,
        JobState::Queued
    );

    // Age the record past the stall threshold, then sweep into a working queue.
    let mut job = store.get(submitted.job_id).await.unwrap();
    job.updated_at = chrono::Utc::now() - chrono::Duration::minutes(30);
    store.force(job).await;

    let queue = Arc::new(vidscribe::kernel::jobs::InMemoryWorkQueue::new());
    let reaper = StalledJobReaper::new(store.clone(), queue.clone(), ReaperConfig::default());
    let report = reaper.sweep_once().await.unwrap();

    assert_eq!(report.requeued, 1);
    let delivery = queue.dequeue("worker-1", Duration::from_secs(60)).await.unwrap().unwrap();
    assert_eq!(delivery.job_id, submitted.job_id);
}
