//! Application setup and server configuration.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{header::CONTENT_TYPE, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::domains::transcription::JobGateway;
use crate::kernel::jobs::{JobStore, WorkQueue};
use crate::kernel::ServerDeps;
use crate::server::routes::{get_task_handler, health_handler, submit_task_handler};

/// Shared application state
#[derive(Clone)]
pub struct AxumAppState {
    pub gateway: JobGateway,
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn WorkQueue>,
}

impl AxumAppState {
    pub fn from_deps(deps: &ServerDeps) -> Self {
        Self {
            gateway: JobGateway::from_deps(deps),
            store: deps.store.clone(),
            queue: deps.queue.clone(),
        }
    }
}

/// Build the Axum application router.
///
/// Workers and the reaper are started separately by the binary; the router
/// only submits and reads jobs.
pub fn build_app(deps: &ServerDeps, allowed_origins: &[String]) -> Router {
    let app_state = AxumAppState::from_deps(deps);

    let cors = CorsLayer::new()
        .allow_origin(cors_origin(allowed_origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE]);

    Router::new()
        .route("/api/tasks", post(submit_task_handler))
        .route("/api/tasks/:job_id", get(get_task_handler))
        .route("/health", get(health_handler))
        // Middleware layers (applied in reverse order - last added runs first)
        .layer(Extension(app_state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_origin(allowed_origins: &[String]) -> AllowOrigin {
    if allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*") {
        return AllowOrigin::from(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    AllowOrigin::list(origins)
}
