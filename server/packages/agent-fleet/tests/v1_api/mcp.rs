use super::*;

async fn create_server(app: &Router, body: Value) -> Value {
    let (status, server) = send_json(app, Method::POST, "/v1/mcp/servers", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED, "create failed: {server}");
    server
}

#[tokio::test]
async fn v1_mcp_export_includes_only_enabled_servers() {
    let test_app = TestApp::new();
    create_server(
        &test_app.app,
        json!({
            "name": "files",
            "type": "stdio",
            "command": "mcp-files",
            "args": ["--root", "/srv"],
            "env": { "LOG": "debug" }
        }),
    )
    .await;
    create_server(
        &test_app.app,
        json!({ "name": "search", "type": "sse", "url": "http://localhost:9000/sse" }),
    )
    .await;
    let disabled = create_server(
        &test_app.app,
        json!({ "name": "off", "type": "http", "url": "http://localhost:9001", "enabled": false }),
    )
    .await;

    let (status, export) = send_json(&test_app.app, Method::GET, "/v1/mcp/export", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        export,
        json!({
            "servers": {
                "files": {
                    "command": "mcp-files",
                    "args": ["--root", "/srv"],
                    "env": { "LOG": "debug" }
                },
                "search": { "url": "http://localhost:9000/sse" }
            }
        })
    );

    let disabled_id = disabled["id"].as_str().expect("id");
    let (status, toggled) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/mcp/servers/{disabled_id}/toggle"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(toggled["enabled"], true);

    let (_, export) = send_json(&test_app.app, Method::GET, "/v1/mcp/export", None).await;
    assert_eq!(export["servers"]["off"], json!({ "url": "http://localhost:9001" }));

    let (_, body) = send_json(&test_app.app, Method::GET, "/v1/mcp/servers?enabledOnly=true", None).await;
    assert_eq!(body["servers"].as_array().map(Vec::len), Some(3));
}

#[tokio::test]
async fn v1_mcp_server_validation() {
    let test_app = TestApp::new();

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/mcp/servers",
        Some(json!({ "name": "broken", "type": "stdio" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_problem(&body, 400, "invalid_request");

    let server = create_server(
        &test_app.app,
        json!({ "name": "remote", "type": "http", "url": "http://localhost:9000" }),
    )
    .await;
    let id = server["id"].as_str().expect("id");
    let (status, body) = send_json(
        &test_app.app,
        Method::PATCH,
        &format!("/v1/mcp/servers/{id}"),
        Some(json!({ "type": "stdio" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_problem(&body, 400, "invalid_request");

    let (status, _) = send_request(
        &test_app.app,
        Method::DELETE,
        &format!("/v1/mcp/servers/{id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send_json(&test_app.app, Method::GET, &format!("/v1/mcp/servers/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
