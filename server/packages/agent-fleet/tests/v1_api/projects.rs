use super::*;

#[tokio::test]
async fn v1_project_picks_up_and_writes_claude_md() {
    let test_app = TestApp::new();
    let project_dir = tempfile::tempdir().expect("project dir");
    std::fs::write(project_dir.path().join("CLAUDE.md"), "# Rules\n").expect("seed CLAUDE.md");
    let path = project_dir.path().to_string_lossy().to_string();

    let (status, project) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/projects",
        Some(json!({ "name": "demo", "path": path })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "create failed: {project}");
    assert_eq!(project["claudeMdContent"], "# Rules\n");
    assert_eq!(project["defaultBranch"], "main");

    let id = project["id"].as_str().expect("id");
    let (status, project) = send_json(
        &test_app.app,
        Method::PATCH,
        &format!("/v1/projects/{id}"),
        Some(json!({ "claudeMdContent": "# New rules\n" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(project["claudeMdContent"], "# New rules\n");
    let on_disk =
        std::fs::read_to_string(project_dir.path().join("CLAUDE.md")).expect("read CLAUDE.md");
    assert_eq!(on_disk, "# New rules\n");

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/projects",
        Some(json!({ "name": "ghost", "path": "/definitely/not/here" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_problem(&body, 400, "invalid_request");
}

#[tokio::test]
async fn v1_project_delete_terminates_its_instances() {
    let test_app = TestApp::new();
    let project_dir = tempfile::tempdir().expect("project dir");
    let path = project_dir.path().to_string_lossy().to_string();
    let (_, project) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/projects",
        Some(json!({ "name": "demo", "path": path })),
    )
    .await;
    let project_id = project["id"].as_str().expect("id").to_string();

    let (status, instance) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/instances",
        Some(json!({ "name": "worker", "projectId": project_id })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let instance_id = instance["id"].as_str().expect("id").to_string();

    let (_, body) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/v1/instances?projectId={project_id}"),
        None,
    )
    .await;
    assert_eq!(body["instances"].as_array().map(Vec::len), Some(1));

    let (status, _) = send_request(
        &test_app.app,
        Method::DELETE,
        &format!("/v1/projects/{project_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(test_app.state.registry().get(&instance_id).is_none());

    let (status, _) = send_json(&test_app.app, Method::GET, &format!("/v1/projects/{project_id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, body) = send_json(&test_app.app, Method::GET, "/v1/projects", None).await;
    assert_eq!(body["projects"].as_array().map(Vec::len), Some(0));
}
