//! SaveResult and GetResult.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use cadence_metrics_store::{GetResultReply, SaveResult};
use tracing::debug;

use super::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/results", post(save_result))
        .route("/results/{namespace}/{inference}", get(get_result))
}

async fn save_result(
    State(state): State<AppState>,
    Json(result): Json<SaveResult>,
) -> Result<StatusCode, ApiError> {
    state.backend().save(&result).await?;
    debug!(
        namespace = %result.namespace,
        inference = %result.inference_name,
        key = %result.key,
        "Result saved"
    );
    Ok(StatusCode::NO_CONTENT)
}

async fn get_result(
    State(state): State<AppState>,
    Path((namespace, inference)): Path<(String, String)>,
) -> Result<Json<GetResultReply>, ApiError> {
    let results = state.backend().get(&namespace, &inference).await?;
    debug!(namespace = %namespace, inference = %inference, rows = results.len(), "Results fetched");
    Ok(Json(GetResultReply {
        namespace,
        inference_name: inference,
        results,
    }))
}
