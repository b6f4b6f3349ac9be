//! Task submission and status endpoints.
//!
//! POST /api/tasks          submit a transcription job (202)
//! GET  /api/tasks/:job_id  read the job snapshot

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::domains::transcription::{GatewayError, SubmitRequest, SubmittedJob};
use crate::kernel::jobs::JobSnapshot;
use crate::server::app::AxumAppState;

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::InvalidInput { field, reason } => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid_input", "field": field, "message": reason })),
            )
                .into_response(),
            GatewayError::NotFound(job_id) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "not_found", "job_id": job_id })),
            )
                .into_response(),
            GatewayError::Store(e) => {
                error!(error = %e, "job store error");
                let status = if e.is_unavailable() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                (status, Json(json!({ "error": "internal", "message": "job store error" }))).into_response()
            }
        }
    }
}

pub async fn submit_task_handler(
    Extension(state): Extension<AxumAppState>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmittedJob>), GatewayError> {
    let Json(request) = body.map_err(|rejection| GatewayError::InvalidInput {
        field: "body",
        reason: rejection.body_text(),
    })?;

    let submitted = state.gateway.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(submitted)))
}

pub async fn get_task_handler(
    Extension(state): Extension<AxumAppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobSnapshot>, GatewayError> {
    let snapshot = state.gateway.query(&job_id).await?;
    Ok(Json(snapshot))
}
