//! HTTP surface tests for billing-engine, driven through the router.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use billing_engine::startup::router;
use common::{monthly_schedule, TestEngine};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::util::ServiceExt;

fn app(engine: &TestEngine) -> Router {
    router(engine.state.clone())
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_ok_with_request_id() {
    let engine = TestEngine::new();

    let response = app(&engine)
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", "req-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "req-123");
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "billing-engine");
}

#[tokio::test]
async fn readiness_and_metrics_respond() {
    let engine = TestEngine::new();

    let ready = app(&engine)
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::OK);

    let metrics = app(&engine)
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(metrics.status(), StatusCode::OK);
    assert!(metrics.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
}

#[tokio::test]
async fn sweep_endpoint_bills_as_of_given_date() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let schedule = engine
        .active_schedule(monthly_schedule(entity.entity_id))
        .await;

    let response = app(&engine)
        .oneshot(post_json("/runs", r#"{"as_of":"2025-01-15"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["as_of"], "2025-01-15");
    assert_eq!(body["succeeded"], 1);
    assert_eq!(body["results"][0]["outcome"], "SUCCESS");
    assert_eq!(body["results"][0]["billing_number"], "INV-2025-00001");
    assert_eq!(engine.invoices_for(schedule.schedule_id).await.len(), 1);
}

#[tokio::test]
async fn run_now_endpoint_reports_errors_by_status() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let schedule = engine
        .active_schedule(monthly_schedule(entity.entity_id))
        .await;

    let missing = app(&engine)
        .oneshot(post_json(
            &format!("/schedules/{}/run", uuid::Uuid::new_v4()),
            "{}",
        ))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    engine
        .state
        .schedules
        .pause(schedule.schedule_id, None)
        .await
        .unwrap();
    let paused = app(&engine)
        .oneshot(post_json(
            &format!("/schedules/{}/run", schedule.schedule_id),
            "{}",
        ))
        .await
        .unwrap();
    assert_eq!(paused.status(), StatusCode::BAD_REQUEST);
    let body = json_body(paused).await;
    assert!(body["error"].as_str().unwrap().contains("PAUSED"));
}

#[tokio::test]
async fn run_history_lists_runs_of_known_schedule() {
    let engine = TestEngine::new();
    let entity = engine.create_entity("INV").await;
    let schedule = engine
        .active_schedule(monthly_schedule(entity.entity_id))
        .await;

    let ran = app(&engine)
        .oneshot(post_json(
            &format!("/schedules/{}/run", schedule.schedule_id),
            "{}",
        ))
        .await
        .unwrap();
    assert_eq!(ran.status(), StatusCode::OK);

    let history = app(&engine)
        .oneshot(
            Request::builder()
                .uri(format!("/schedules/{}/runs", schedule.schedule_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(history.status(), StatusCode::OK);
    let body = json_body(history).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["status"], "SUCCESS");
    assert_eq!(body[0]["run_type"], "manual");

    let unknown = app(&engine)
        .oneshot(
            Request::builder()
                .uri(format!("/schedules/{}/runs", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
}
