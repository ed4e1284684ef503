use super::*;

async fn run_query(app: &Router, instance_id: &str, prompt: &str) -> String {
    let (status, outcome) = send_json(
        app,
        Method::POST,
        &format!("/v1/instances/{instance_id}/query"),
        Some(json!({ "prompt": prompt })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "query failed: {outcome}");
    outcome["sessionId"].as_str().expect("session id").to_string()
}

#[tokio::test]
async fn v1_sessions_list_export_and_delete() {
    let test_app = TestApp::new();
    let alpha = create_instance(&test_app.app, "alpha").await;
    let beta = create_instance(&test_app.app, "beta").await;
    let alpha_id = alpha["id"].as_str().expect("id").to_string();
    let beta_id = beta["id"].as_str().expect("id").to_string();

    let first = run_query(&test_app.app, &alpha_id, "one").await;
    run_query(&test_app.app, &alpha_id, "two").await;
    run_query(&test_app.app, &beta_id, "three").await;

    let (status, body) = send_json(&test_app.app, Method::GET, "/v1/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessions"].as_array().map(Vec::len), Some(3));

    let (_, body) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/v1/sessions?instanceId={alpha_id}"),
        None,
    )
    .await;
    let sessions = body["sessions"].as_array().expect("sessions");
    assert_eq!(sessions.len(), 2);
    assert!(sessions.iter().all(|session| session["instanceId"] == alpha_id.as_str()));

    let (status, session) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/v1/sessions/{first}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["status"], "completed");
    assert!(session["endedAt"].as_str().is_some());

    let (status, export) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/v1/sessions/{first}/export"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(export["sessionId"], first.as_str());
    assert_eq!(export["instanceId"], alpha_id.as_str());
    assert_eq!(export["messages"][0]["content"], "one");
    assert_eq!(export["messages"][1]["content"], "mock: one");

    let (status, _) = send_request(
        &test_app.app,
        Method::DELETE,
        &format!("/v1/sessions/{first}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/v1/sessions/{first}/messages"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_problem(&body, 404, "record_not_found");
    assert_eq!(body["kind"], "session");
}
