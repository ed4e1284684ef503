use std::sync::Arc;

use agent_fleet::agent::{AgentEvent, MockStep};
use tokio::sync::Notify;

use super::*;

#[tokio::test]
async fn v1_health_openapi_and_fallback() {
    let test_app = TestApp::new();

    let (status, body) = send_json(&test_app.app, Method::GET, "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send_json(&test_app.app, Method::GET, "/v1/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/v1/instances/{instance_id}/query"].is_object());

    let (status, _) = send_request(&test_app.app, Method::GET, "/v1/nothing-here", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn v1_create_query_and_read_back_history() {
    let test_app = TestApp::new();
    let instance = create_instance(&test_app.app, "alpha").await;
    let id = instance["id"].as_str().expect("instance id").to_string();
    assert_eq!(instance["status"], "active");
    assert!(test_app.workdir().join(&id).is_dir());

    let (status, outcome) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/instances/{id}/query"),
        Some(json!({ "prompt": "hello there" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "query failed: {outcome}");
    assert_eq!(outcome["status"], "completed");
    let messages = outcome["messages"].as_array().expect("messages");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["content"], "hello there");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"], "mock: hello there");

    let session_id = outcome["sessionId"].as_str().expect("session id");
    let (status, body) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/v1/sessions/{session_id}/messages"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["messages"].as_array().map(Vec::len), Some(2));

    let (status, body) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/v1/instances/{id}/status"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["runtime"], "active");
    assert_eq!(body["busy"], false);
}

#[tokio::test]
async fn v1_unknown_instance_is_problem_404() {
    let test_app = TestApp::new();

    let (status, body) = send_json(&test_app.app, Method::GET, "/v1/instances/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_problem(&body, 404, "instance_not_found");
    assert_eq!(body["instanceId"], "missing");

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/instances/missing/query",
        Some(json!({ "prompt": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_problem(&body, 404, "instance_not_found");
}

#[tokio::test]
async fn v1_capacity_overflow_is_429_and_recorded_as_error() {
    let test_app = TestApp::with_capacity(1);
    create_instance(&test_app.app, "first").await;

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/instances",
        Some(json!({ "name": "second" })),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_problem(&body, 429, "capacity_exceeded");
    assert_eq!(body["maxInstances"], 1);

    let (status, body) = send_json(&test_app.app, Method::GET, "/v1/instances?status=error", None).await;
    assert_eq!(status, StatusCode::OK);
    let instances = body["instances"].as_array().expect("instances");
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0]["name"], "second");
    assert_eq!(test_app.state.registry().len(), 1);
}

#[tokio::test]
async fn v1_query_validation() {
    let test_app = TestApp::new();
    let instance = create_instance(&test_app.app, "alpha").await;
    let id = instance["id"].as_str().expect("instance id").to_string();

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/instances/{id}/query"),
        Some(json!({ "prompt": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_problem(&body, 400, "invalid_request");

    test_app
        .state
        .registry()
        .terminate(&id)
        .await
        .expect("terminate");
    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/instances/{id}/query"),
        Some(json!({ "prompt": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_problem(&body, 400, "invalid_request");
}

#[tokio::test]
async fn v1_concurrent_query_is_busy() {
    let gate = Arc::new(Notify::new());
    let runtime = MockRuntime::scripted(vec![
        MockStep::Emit(AgentEvent::text("working")),
        MockStep::Wait(gate.clone()),
        MockStep::Emit(AgentEvent::text(" done")),
    ]);
    let test_app = TestApp::with_runtime(2, runtime);
    let instance = create_instance(&test_app.app, "alpha").await;
    let id = instance["id"].as_str().expect("instance id").to_string();

    let app = test_app.app.clone();
    let uri = format!("/v1/instances/{id}/query");
    let first = tokio::spawn(async move {
        send_json(&app, Method::POST, &uri, Some(json!({ "prompt": "one" }))).await
    });

    let handle = test_app.state.registry().get(&id).expect("live handle");
    tokio::time::timeout(Duration::from_secs(5), async {
        while !handle.is_busy() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first query never started");

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/instances/{id}/query"),
        Some(json!({ "prompt": "two" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_problem(&body, 409, "busy");

    gate.notify_one();
    let (status, outcome) = first.await.expect("first query task");
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["messages"][1]["content"], "working done");
    assert!(!handle.is_busy());
}

#[tokio::test]
async fn v1_restart_update_and_delete() {
    let test_app = TestApp::new();
    let instance = create_instance(&test_app.app, "alpha").await;
    let id = instance["id"].as_str().expect("instance id").to_string();

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/instances/{id}/restart"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "active");

    let (status, body) = send_json(
        &test_app.app,
        Method::PATCH,
        &format!("/v1/instances/{id}"),
        Some(json!({ "name": "renamed", "systemPrompt": "be brief" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "renamed");
    assert_eq!(body["systemPrompt"], "be brief");
    assert_eq!(body["status"], "active");

    let (status, _) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/instances/{id}/query"),
        Some(json!({ "prompt": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send_request(
        &test_app.app,
        Method::DELETE,
        &format!("/v1/instances/{id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(test_app.state.registry().is_empty());

    let (status, _) = send_json(&test_app.app, Method::GET, &format!("/v1/instances/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/v1/sessions?instanceId={id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessions"].as_array().map(Vec::len), Some(0));
}
