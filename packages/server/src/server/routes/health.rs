use std::time::Duration;

use axum::{extract::Extension, http::StatusCode, Json};
use serde::Serialize;

use crate::server::app::AxumAppState;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_jobs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Health check endpoint
///
/// Checks:
/// - Job store connectivity and responsiveness
/// - Work queue depth (informational)
///
/// Returns 200 OK if the store answers, 503 Service Unavailable otherwise.
pub async fn health_handler(Extension(state): Extension<AxumAppState>) -> (StatusCode, Json<HealthResponse>) {
    let store_error = match tokio::time::timeout(CHECK_TIMEOUT, state.store.health_check()).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(format!("Store check failed: {}", e)),
        Err(_) => Some("Store check timeout (>5s)".to_string()),
    };

    let pending_jobs = match tokio::time::timeout(CHECK_TIMEOUT, state.queue.pending()).await {
        Ok(Ok(pending)) => Some(pending),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "failed to read queue depth");
            None
        }
        Err(_) => None,
    };

    let is_healthy = store_error.is_none();
    let status_code = if is_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if is_healthy { "healthy" } else { "unhealthy" }.to_string(),
            store: if is_healthy { "ok" } else { "error" }.to_string(),
            pending_jobs,
            error: store_error,
        }),
    )
}
