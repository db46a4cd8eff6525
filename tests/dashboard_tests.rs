
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use gradebox::config::AdmissionConfig;
use gradebox::dashboard::{router, DashboardState};
use gradebox::worker::HandlerMap;
use test_harness::{Behavior, Harness, HarnessOptions, ScriptedHandler};

fn create_test_app(harness: &Harness) -> Router {
    router(DashboardState {
        service: harness.service.clone(),
        queue: harness.queue.clone(),
    })
}

fn create_test_harness() -> Harness {
    Harness::new(HarnessOptions {
        handlers: HandlerMap::new().with("hw1", ScriptedHandler::new(Behavior::Score(9.0, "ok"))),
        admission: AdmissionConfig {
            max_ongoing_builds: Some(1),
            per_assignment: false,
        },
        ..HarnessOptions::default()
    })
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_queue_empty() {
    let harness = create_test_harness();

    let (status, json) = get_json(create_test_app(&harness), "/api/queue").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["length"], 0);
    assert!(json["jobs"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_submit_build_is_queued() {
    let harness = create_test_harness();

    let (status, json) = post_json(
        create_test_app(&harness),
        "/api/builds",
        json!({"job": "hw1", "source": "ab", "commit": "abc123"}),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["admitted"], true);
    let name = json["build_name"].as_str().unwrap().to_string();
    assert!(name.starts_with("hw1-build-"));
    assert!(json.get("reason").is_none());

    let (_, queue) = get_json(create_test_app(&harness), "/api/queue").await;
    assert_eq!(queue["length"], 1);
    assert_eq!(queue["jobs"][0]["build_name"], name.as_str());
    assert_eq!(queue["jobs"][0]["trigger"], "Manual submission");
}

#[tokio::test]
async fn test_submit_over_ceiling_returns_429() {
    let harness = create_test_harness();
    let request = json!({"job": "hw1", "source": "ab"});

    let (first, _) = post_json(create_test_app(&harness), "/api/builds", request.clone()).await;
    assert_eq!(first, StatusCode::ACCEPTED);

    let (status, json) = post_json(create_test_app(&harness), "/api/builds", request).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json["admitted"], false);
    assert_eq!(
        json["reason"],
        "Cannot have more than 1 build in progress or queued."
    );
}

#[tokio::test]
async fn test_submit_unknown_assignment_returns_400() {
    let harness = create_test_harness();

    let (status, json) = post_json(
        create_test_app(&harness),
        "/api/builds",
        json!({"job": "hw9", "source": "ab"}),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("hw9"));
}

#[tokio::test]
async fn test_build_details_after_grading() {
    let harness = create_test_harness();
    let (_, submitted) = post_json(
        create_test_app(&harness),
        "/api/builds",
        json!({"job": "hw1", "source": "ab"}),
    )
    .await;
    let name = submitted["build_name"].as_str().unwrap().to_string();

    let (_, queued) = get_json(create_test_app(&harness), &format!("/api/builds/{}", name)).await;
    assert_eq!(queued["status"], "queued");

    let job = harness.queue.try_dequeue().unwrap();
    harness.worker().process(job).await;

    let (status, json) = get_json(create_test_app(&harness), &format!("/api/builds/{}", name)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["name"], name.as_str());
    assert_eq!(json["status"], "success");
    assert_eq!(json["score"], 9.0);
    assert_eq!(json["log"], "ok");
    assert_eq!(json["source"], "ab");
    assert!(json["status_text"].is_string());
}

#[tokio::test]
async fn test_unknown_build_returns_404() {
    let harness = create_test_harness();

    let (status, json) = get_json(create_test_app(&harness), "/api/builds/hw1-build-404").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("hw1-build-404"));
}

#[tokio::test]
async fn test_stop_build() {
    let harness = create_test_harness();
    let (_, submitted) = post_json(
        create_test_app(&harness),
        "/api/builds",
        json!({"job": "hw1", "source": "ab"}),
    )
    .await;
    let name = submitted["build_name"].as_str().unwrap().to_string();
    let uri = format!("/api/builds/{}/stop", name);

    let (status, json) = post_json(create_test_app(&harness), &uri, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["build_name"], name.as_str());
    assert_eq!(json["stopped"], true);

    let (_, build) = get_json(create_test_app(&harness), &format!("/api/builds/{}", name)).await;
    assert_eq!(build["status"], "failed");
    assert_eq!(build["log"], "Build interrupted.");

    // Already finished
    let (_, again) = post_json(create_test_app(&harness), &uri, json!({})).await;
    assert_eq!(again["stopped"], false);
}

#[tokio::test]
async fn test_stop_unknown_build_returns_404() {
    let harness = create_test_harness();

    let (status, _) = post_json(
        create_test_app(&harness),
        "/api/builds/hw1-build-404/stop",
        json!({}),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_workers() {
    let harness = create_test_harness();
    let worker = harness.worker();
    harness.worker();

    let (status, json) = get_json(create_test_app(&harness), "/api/workers").await;
    assert_eq!(status, StatusCode::OK);
    let workers = json.as_array().unwrap();
    assert_eq!(workers.len(), 2);
    assert!(workers[0].get("log").is_none());

    let (_, with_log) = get_json(create_test_app(&harness), "/api/workers?log=true").await;
    assert!(with_log[0]["log"].is_array());

    let (status, single) =
        get_json(create_test_app(&harness), &format!("/api/workers/{}", worker.id())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(single["id"], worker.id());
    assert!(single["current_build"].is_null());
}

#[tokio::test]
async fn test_worker_log_records_processed_build() {
    let harness = create_test_harness();
    let worker = harness.worker();
    let submission = harness
        .service
        .submit(serde_json::from_value(json!({"job": "hw1", "source": "ab"})).unwrap())
        .await
        .unwrap();
    let job = harness.queue.try_dequeue().unwrap();
    worker.process(job).await;

    let (_, json) =
        get_json(create_test_app(&harness), &format!("/api/workers/{}", worker.id())).await;
    let log = json["log"].as_array().unwrap();
    assert!(log
        .iter()
        .any(|entry| entry["message"].as_str().unwrap().contains(&submission.build_name)));
}

#[tokio::test]
async fn test_unknown_worker_returns_404() {
    let harness = create_test_harness();

    let (status, json) = get_json(create_test_app(&harness), "/api/workers/99").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "Worker not found: 99");
}
