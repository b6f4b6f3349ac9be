//! HTTP surface tests driven through the axum router with `oneshot`.

mod common;

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::common::{test_settings, TestApp};
use vidscribe::common::JobId;
use vidscribe::kernel::jobs::{InMemoryWorkQueue, JobStore, Mutator, StoreError, TranscriptionJob};
use vidscribe::kernel::{ServerDeps, TestDependencies};
use vidscribe::server::build_app;

fn router(app: &TestApp) -> Router {
    build_app(&app.deps, &["*".to_string()])
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

// ============================================================================
// Tasks
// ============================================================================

#[tokio::test]
async fn submit_returns_202_with_a_queued_job() {
    let app = TestApp::new(TestDependencies::new());
    let body = json!({ "video_url": "https://video.example/watch?v=1", "output_format": "subtitle" });

    let (status, body) = send(router(&app), post_json("/api/tasks", &body.to_string())).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["state"], "queued");
    assert!(body["created_at"].is_string());
    let job_id: JobId = body["job_id"].as_str().unwrap().parse().unwrap();
    assert!(app.store.get(job_id).await.is_ok());
}

#[tokio::test]
async fn submit_with_bad_input_returns_400_naming_the_field() {
    let app = TestApp::new(TestDependencies::new());

    let (status, body) = send(router(&app), post_json("/api/tasks", r#"{"video_url": ""}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_input");
    assert_eq!(body["field"], "video_url");
    assert!(body["message"].is_string());

    let (status, body) = send(
        router(&app),
        post_json(
            "/api/tasks",
            r#"{"video_url": "https://video.example/a", "model_size": "gigantic"}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["field"], "model_size");

    assert_eq!(app.store.raw_len().await, 0);
}

#[tokio::test]
async fn malformed_body_is_rejected_as_invalid_input() {
    let app = TestApp::new(TestDependencies::new());

    let (status, body) = send(router(&app), post_json("/api/tasks", "{not json")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_input");
    assert_eq!(body["field"], "body");
}

#[tokio::test]
async fn get_task_returns_the_snapshot() {
    let app = TestApp::new(TestDependencies::new());
    let job_id = app.submit("https://video.example/status").await;

    let (status, body) = send(router(&app), get(&format!("/api/tasks/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job_id"], job_id.to_string());
    assert_eq!(body["state"], "queued");
    assert!(body.get("result").is_none());
    assert!(body.get("claim").is_none(), "internal fields stay private");

    app.coordinator().run(job_id, "worker-1").await.unwrap().unwrap();

    let (status, body) = send(router(&app), get(&format!("/api/tasks/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "completed");
    assert_eq!(body["result"]["format"], "text");
    assert_eq!(body["result"]["text"], "Hello world. This is a test.");
    assert!(body.get("error").is_none());
}

#[tokio::test]
async fn failed_task_reports_stage_and_kind() {
    let mocks = TestDependencies::new().with_downloader(
        vidscribe::kernel::test_dependencies::MockDownloader::new()
            .with_failure(vidscribe::kernel::FailureKind::UnsupportedMedia, "Private video"),
    );
    let app = TestApp::new(mocks);
    let job_id = app.submit("https://video.example/private").await;
    app.coordinator().run(job_id, "worker-1").await.unwrap().unwrap();

    let (status, body) = send(router(&app), get(&format!("/api/tasks/{job_id}"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "failed");
    assert_eq!(body["error"]["stage"], "download");
    assert_eq!(body["error"]["kind"], "unsupported_media");
    assert_eq!(body["error"]["message"], "Private video");
    assert!(body.get("result").is_none());
}

#[tokio::test]
async fn unknown_task_returns_404() {
    let app = TestApp::new(TestDependencies::new());

    let (status, body) = send(router(&app), get(&format!("/api/tasks/{}", JobId::new()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, _) = send(router(&app), get("/api/tasks/garbage")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn health_reports_store_and_queue_depth() {
    let app = TestApp::new(TestDependencies::new());
    app.submit("https://video.example/pending").await;

    let (status, body) = send(router(&app), get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store"], "ok");
    assert_eq!(body["pending_jobs"], 1);
}

/// Store whose backend is gone.
struct UnavailableStore;

#[async_trait]
impl JobStore for UnavailableStore {
    async fn put(&self, _job: TranscriptionJob) -> Result<(), StoreError> {
        Err(StoreError::Internal(anyhow!("connection refused")))
    }

    async fn get(&self, _id: JobId) -> Result<TranscriptionJob, StoreError> {
        Err(StoreError::Internal(anyhow!("connection refused")))
    }

    async fn update(&self, _id: JobId, _mutate: Mutator<'_>) -> Result<TranscriptionJob, StoreError> {
        Err(StoreError::Internal(anyhow!("connection refused")))
    }

    async fn list_unfinished(&self, _limit: usize) -> Result<Vec<TranscriptionJob>, StoreError> {
        Err(StoreError::Internal(anyhow!("connection refused")))
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<u64, StoreError> {
        Err(StoreError::Internal(anyhow!("connection refused")))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Err(StoreError::Internal(anyhow!("connection refused")))
    }
}

#[tokio::test]
async fn unavailable_store_is_reported_as_503() {
    common::init_tracing();
    let deps = ServerDeps::new(
        Arc::new(UnavailableStore),
        Arc::new(InMemoryWorkQueue::new()),
        TestDependencies::new().executors(),
        test_settings(),
    );
    let router = build_app(&deps, &[]);

    let (status, body) = send(router.clone(), get("/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["store"], "error");

    let (status, body) = send(
        router,
        post_json("/api/tasks", r#"{"video_url": "https://video.example/a"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "internal");
}
