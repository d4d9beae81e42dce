//! Router tests over the in-memory backend.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use cadence_metrics_server::{api::create_router, state::AppState};
use cadence_metrics_store::{MemoryBackend, PostgresBackend, StoreConfig};
use serde_json::{json, Value};
use tower::ServiceExt;

fn router() -> Router {
    let state = AppState::new(Arc::new(MemoryBackend::new()));
    state.mark_ready();
    create_router(state)
}

fn save(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/results")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn repeated_save_keeps_one_row() {
    let router = router();
    for value in ["42", "50"] {
        let resp = router
            .clone()
            .oneshot(save(json!({
                "namespace": "ns",
                "inferenceName": "inf-1",
                "key": "cpu",
                "value": value
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    let resp = router.oneshot(get("/v1/results/ns/inf-1")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = json_body(resp).await;
    assert_eq!(body["inferenceName"], "inf-1");
    assert_eq!(body["results"], json!([{ "key": "cpu", "value": "50" }]));
}

#[tokio::test]
async fn unknown_inference_returns_empty_results() {
    let resp = router().oneshot(get("/v1/results/ns/missing")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["results"], json!([]));
}

#[tokio::test]
async fn empty_key_is_rejected() {
    let resp = router()
        .oneshot(save(json!({
            "namespace": "ns",
            "inferenceName": "inf-1",
            "key": "",
            "value": "1"
        })))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(resp).await["code"], "invalid_result");
}

#[tokio::test]
async fn uninitialized_store_is_unavailable() {
    let state = AppState::new(Arc::new(PostgresBackend::new(StoreConfig::default())));
    let router = create_router(state);

    let resp = router.clone().oneshot(get("/readyz")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let resp = router.clone().oneshot(get("/healthz")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = router.oneshot(get("/v1/results/ns/inf-1")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn ready_store_reports_backend() {
    let resp = router().oneshot(get("/readyz")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["backend"], "memory");
}
