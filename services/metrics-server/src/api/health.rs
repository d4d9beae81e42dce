//! Health check endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok" or "unavailable".
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

fn response(status: &str, backend: Option<String>) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        service: "metrics-server".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        backend,
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

/// Liveness: the process is serving requests.
async fn healthz() -> impl IntoResponse {
    Json(response("ok", None))
}

/// Readiness: the storage backend is initialized.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let backend = Some(state.backend().name().to_string());
    if state.is_ready() {
        (StatusCode::OK, Json(response("ok", backend)))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(response("unavailable", backend)),
        )
    }
}
