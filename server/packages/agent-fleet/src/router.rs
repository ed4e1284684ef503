use std::sync::Arc;
use std::time::Duration;

use agent_fleet_error::{ErrorType, FleetError, ProblemDetails};
use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::agent::{AgentRuntime, QueryOptions};
use crate::bridge::{self, ServerEvent, ServerEventType, WatchHub};
use crate::config::FleetConfig;
use crate::mcp::{McpConfigExport, McpServerEntry};
use crate::orchestrator::QueryOutcome;
use crate::registry::{InstanceRegistry, RuntimeStatus};
use crate::service::{
    CreateInstanceRequest, CreateMcpServerRequest, CreateProjectRequest, InstanceService,
    InstanceStatusView, McpService, ProjectService, QueryRequest, SessionExport, SessionService,
    UpdateInstanceRequest, UpdateMcpServerRequest, UpdateProjectRequest,
};
use crate::store::{
    InstanceFilter, InstanceRecord, InstanceStatus, McpServerRecord, McpServerType, MessageRecord,
    MessageRole, ProjectRecord, SessionRecord, SessionStatus, Store,
};

mod types;

pub use types::*;

#[derive(Debug)]
pub struct AppState {
    store: Arc<dyn Store>,
    registry: Arc<InstanceRegistry>,
    hub: Arc<WatchHub>,
    instances: InstanceService,
    sessions: SessionService,
    mcp: McpService,
    projects: ProjectService,
}

impl AppState {
    pub fn new(config: FleetConfig, store: Arc<dyn Store>, runtime: Arc<dyn AgentRuntime>) -> Self {
        let registry = Arc::new(InstanceRegistry::new(config, store.clone(), runtime));
        let hub = Arc::new(WatchHub::new());
        Self {
            instances: InstanceService::new(store.clone(), registry.clone(), hub.clone()),
            sessions: SessionService::new(store.clone()),
            mcp: McpService::new(store.clone()),
            projects: ProjectService::new(store.clone(), registry.clone()),
            store,
            registry,
            hub,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<WatchHub> {
        &self.hub
    }

    pub fn instances(&self) -> &InstanceService {
        &self.instances
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/instances", get(list_instances).post(create_instance))
        .route(
            "/instances/:instance_id",
            get(get_instance)
                .patch(update_instance)
                .delete(delete_instance),
        )
        .route("/instances/:instance_id/query", post(query_instance))
        .route("/instances/:instance_id/restart", post(restart_instance))
        .route("/instances/:instance_id/status", get(get_instance_status))
        .route("/sessions", get(list_sessions))
        .route(
            "/sessions/:session_id",
            get(get_session).delete(delete_session),
        )
        .route("/sessions/:session_id/messages", get(get_session_messages))
        .route("/sessions/:session_id/export", get(export_session))
        .route("/projects", get(list_projects).post(create_project))
        .route(
            "/projects/:project_id",
            get(get_project)
                .patch(update_project)
                .delete(delete_project),
        )
        .route("/mcp/servers", get(list_mcp_servers).post(create_mcp_server))
        .route(
            "/mcp/servers/:server_id",
            get(get_mcp_server)
                .patch(update_mcp_server)
                .delete(delete_mcp_server),
        )
        .route("/mcp/servers/:server_id/toggle", post(toggle_mcp_server))
        .route("/mcp/export", get(export_mcp_config))
        .with_state(shared.clone());

    let ws_router = Router::new()
        .route("/instances/:instance_id/stream", get(bridge::ws_stream))
        .route("/instances/:instance_id/interact", get(bridge::ws_interact))
        .with_state(shared.clone());

    let mut router = Router::new()
        .route("/", get(get_root))
        .nest("/v1", v1_router)
        .nest("/ws", ws_router)
        .fallback(not_found);

    let http_logging = match std::env::var("AGENT_FLEET_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

/// Ends the lifecycle of every live instance.
pub async fn shutdown_instances(state: &Arc<AppState>) {
    state.registry.shutdown().await;
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        list_instances,
        create_instance,
        get_instance,
        update_instance,
        delete_instance,
        query_instance,
        restart_instance,
        get_instance_status,
        list_sessions,
        get_session,
        delete_session,
        get_session_messages,
        export_session,
        list_projects,
        create_project,
        get_project,
        update_project,
        delete_project,
        list_mcp_servers,
        create_mcp_server,
        get_mcp_server,
        update_mcp_server,
        delete_mcp_server,
        toggle_mcp_server,
        export_mcp_config
    ),
    components(
        schemas(
            HealthResponse,
            InstanceRecord,
            InstanceStatus,
            InstanceListResponse,
            CreateInstanceRequest,
            UpdateInstanceRequest,
            InstanceStatusView,
            RuntimeStatus,
            QueryRequest,
            QueryOptions,
            QueryOutcome,
            SessionRecord,
            SessionStatus,
            SessionListResponse,
            SessionExport,
            MessageRecord,
            MessageRole,
            MessageListResponse,
            ProjectRecord,
            ProjectListResponse,
            CreateProjectRequest,
            UpdateProjectRequest,
            McpServerRecord,
            McpServerType,
            McpServerListResponse,
            CreateMcpServerRequest,
            UpdateMcpServerRequest,
            McpConfigExport,
            McpServerEntry,
            ServerEvent,
            ServerEventType,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "instances", description = "Agent instance lifecycle and queries"),
        (name = "sessions", description = "Conversation history"),
        (name = "projects", description = "Project management"),
        (name = "mcp", description = "Tool server configuration")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:8000")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Fleet(#[from] FleetError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Fleet(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

const SERVER_INFO: &str = "\
This is an agent-fleet server. Available endpoints:\n\
  - GET  /                            - Server info\n\
  - GET  /v1/health                   - Health check\n\
  - GET  /v1/openapi.json             - OpenAPI document\n\
  - GET  /ws/instances/{id}/stream    - Watch instance output\n\
  - GET  /ws/instances/{id}/interact  - Interactive queries\n";

async fn get_root() -> &'static str {
    SERVER_INFO
}

async fn not_found() -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("404 Not Found\n\n{SERVER_INFO}"),
    )
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/v1/instances",
    params(
        ("projectId" = Option<String>, Query, description = "Only instances of this project"),
        ("status" = Option<InstanceStatus>, Query, description = "Only instances in this status")
    ),
    responses((status = 200, body = InstanceListResponse)),
    tag = "instances"
)]
async fn list_instances(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InstanceListQuery>,
) -> Result<Json<InstanceListResponse>, ApiError> {
    let instances = state
        .instances
        .list(InstanceFilter {
            project_id: query.project_id,
            status: query.status,
        })
        .await?;
    Ok(Json(InstanceListResponse { instances }))
}

#[utoipa::path(
    post,
    path = "/v1/instances",
    request_body = CreateInstanceRequest,
    responses(
        (status = 201, body = InstanceRecord),
        (status = 400, body = ProblemDetails),
        (status = 429, body = ProblemDetails)
    ),
    tag = "instances"
)]
async fn create_instance(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<InstanceRecord>), ApiError> {
    let record = state.instances.create(request).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[utoipa::path(
    get,
    path = "/v1/instances/{instance_id}",
    params(("instance_id" = String, Path, description = "Instance id")),
    responses(
        (status = 200, body = InstanceRecord),
        (status = 404, body = ProblemDetails)
    ),
    tag = "instances"
)]
async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<Json<InstanceRecord>, ApiError> {
    Ok(Json(state.instances.get(&instance_id).await?))
}

#[utoipa::path(
    patch,
    path = "/v1/instances/{instance_id}",
    request_body = UpdateInstanceRequest,
    params(("instance_id" = String, Path, description = "Instance id")),
    responses(
        (status = 200, body = InstanceRecord),
        (status = 404, body = ProblemDetails)
    ),
    tag = "instances"
)]
async fn update_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(request): Json<UpdateInstanceRequest>,
) -> Result<Json<InstanceRecord>, ApiError> {
    Ok(Json(state.instances.update(&instance_id, request).await?))
}

#[utoipa::path(
    delete,
    path = "/v1/instances/{instance_id}",
    params(("instance_id" = String, Path, description = "Instance id")),
    responses(
        (status = 204, description = "Instance deleted"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "instances"
)]
async fn delete_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.instances.delete(&instance_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/v1/instances/{instance_id}/query",
    request_body = QueryRequest,
    params(("instance_id" = String, Path, description = "Instance id")),
    responses(
        (status = 200, body = QueryOutcome),
        (status = 404, body = ProblemDetails),
        (status = 409, body = ProblemDetails),
        (status = 502, body = ProblemDetails)
    ),
    tag = "instances"
)]
async fn query_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryOutcome>, ApiError> {
    Ok(Json(state.instances.query(&instance_id, request).await?))
}

#[utoipa::path(
    post,
    path = "/v1/instances/{instance_id}/restart",
    params(("instance_id" = String, Path, description = "Instance id")),
    responses(
        (status = 200, body = InstanceRecord),
        (status = 404, body = ProblemDetails),
        (status = 429, body = ProblemDetails)
    ),
    tag = "instances"
)]
async fn restart_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<Json<InstanceRecord>, ApiError> {
    Ok(Json(state.instances.restart(&instance_id).await?))
}

#[utoipa::path(
    get,
    path = "/v1/instances/{instance_id}/status",
    params(("instance_id" = String, Path, description = "Instance id")),
    responses(
        (status = 200, body = InstanceStatusView),
        (status = 404, body = ProblemDetails)
    ),
    tag = "instances"
)]
async fn get_instance_status(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<Json<InstanceStatusView>, ApiError> {
    Ok(Json(state.instances.status(&instance_id).await?))
}

#[utoipa::path(
    get,
    path = "/v1/sessions",
    params(("instanceId" = Option<String>, Query, description = "Only sessions of this instance")),
    responses((status = 200, body = SessionListResponse)),
    tag = "sessions"
)]
async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionListQuery>,
) -> Result<Json<SessionListResponse>, ApiError> {
    let sessions = state.sessions.list(query.instance_id.as_deref()).await?;
    Ok(Json(SessionListResponse { sessions }))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = SessionRecord),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionRecord>, ApiError> {
    Ok(Json(state.sessions.get(&session_id).await?))
}

#[utoipa::path(
    delete,
    path = "/v1/sessions/{session_id}",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 204, description = "Session deleted"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.sessions.delete(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/messages",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = MessageListResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn get_session_messages(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<MessageListResponse>, ApiError> {
    let messages = state.sessions.messages(&session_id).await?;
    Ok(Json(MessageListResponse { messages }))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/export",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = SessionExport),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn export_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionExport>, ApiError> {
    Ok(Json(state.sessions.export(&session_id).await?))
}

#[utoipa::path(
    get,
    path = "/v1/projects",
    responses((status = 200, body = ProjectListResponse)),
    tag = "projects"
)]
async fn list_projects(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ProjectListResponse>, ApiError> {
    let projects = state.projects.list().await?;
    Ok(Json(ProjectListResponse { projects }))
}

#[utoipa::path(
    post,
    path = "/v1/projects",
    request_body = CreateProjectRequest,
    responses(
        (status = 201, body = ProjectRecord),
        (status = 400, body = ProblemDetails)
    ),
    tag = "projects"
)]
async fn create_project(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<ProjectRecord>), ApiError> {
    let project = state.projects.create(request).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

#[utoipa::path(
    get,
    path = "/v1/projects/{project_id}",
    params(("project_id" = String, Path, description = "Project id")),
    responses(
        (status = 200, body = ProjectRecord),
        (status = 404, body = ProblemDetails)
    ),
    tag = "projects"
)]
async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectRecord>, ApiError> {
    Ok(Json(state.projects.get(&project_id).await?))
}

#[utoipa::path(
    patch,
    path = "/v1/projects/{project_id}",
    request_body = UpdateProjectRequest,
    params(("project_id" = String, Path, description = "Project id")),
    responses(
        (status = 200, body = ProjectRecord),
        (status = 404, body = ProblemDetails)
    ),
    tag = "projects"
)]
async fn update_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Json(request): Json<UpdateProjectRequest>,
) -> Result<Json<ProjectRecord>, ApiError> {
    Ok(Json(state.projects.update(&project_id, request).await?))
}

#[utoipa::path(
    delete,
    path = "/v1/projects/{project_id}",
    params(("project_id" = String, Path, description = "Project id")),
    responses(
        (status = 204, description = "Project and its instances deleted"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "projects"
)]
async fn delete_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.projects.delete(&project_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/v1/mcp/servers",
    params(("enabledOnly" = Option<bool>, Query, description = "Only enabled servers")),
    responses((status = 200, body = McpServerListResponse)),
    tag = "mcp"
)]
async fn list_mcp_servers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<McpServerListQuery>,
) -> Result<Json<McpServerListResponse>, ApiError> {
    let servers = state.mcp.list(query.enabled_only.unwrap_or(false)).await?;
    Ok(Json(McpServerListResponse { servers }))
}

#[utoipa::path(
    post,
    path = "/v1/mcp/servers",
    request_body = CreateMcpServerRequest,
    responses(
        (status = 201, body = McpServerRecord),
        (status = 400, body = ProblemDetails)
    ),
    tag = "mcp"
)]
async fn create_mcp_server(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateMcpServerRequest>,
) -> Result<(StatusCode, Json<McpServerRecord>), ApiError> {
    let server = state.mcp.create(request).await?;
    Ok((StatusCode::CREATED, Json(server)))
}

#[utoipa::path(
    get,
    path = "/v1/mcp/servers/{server_id}",
    params(("server_id" = String, Path, description = "MCP server id")),
    responses(
        (status = 200, body = McpServerRecord),
        (status = 404, body = ProblemDetails)
    ),
    tag = "mcp"
)]
async fn get_mcp_server(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<McpServerRecord>, ApiError> {
    Ok(Json(state.mcp.get(&server_id).await?))
}

#[utoipa::path(
    patch,
    path = "/v1/mcp/servers/{server_id}",
    request_body = UpdateMcpServerRequest,
    params(("server_id" = String, Path, description = "MCP server id")),
    responses(
        (status = 200, body = McpServerRecord),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    tag = "mcp"
)]
async fn update_mcp_server(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
    Json(request): Json<UpdateMcpServerRequest>,
) -> Result<Json<McpServerRecord>, ApiError> {
    Ok(Json(state.mcp.update(&server_id, request).await?))
}

#[utoipa::path(
    delete,
    path = "/v1/mcp/servers/{server_id}",
    params(("server_id" = String, Path, description = "MCP server id")),
    responses(
        (status = 204, description = "MCP server deleted"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "mcp"
)]
async fn delete_mcp_server(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.mcp.delete(&server_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/v1/mcp/servers/{server_id}/toggle",
    params(("server_id" = String, Path, description = "MCP server id")),
    responses(
        (status = 200, body = McpServerRecord),
        (status = 404, body = ProblemDetails)
    ),
    tag = "mcp"
)]
async fn toggle_mcp_server(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<McpServerRecord>, ApiError> {
    Ok(Json(state.mcp.toggle(&server_id).await?))
}

#[utoipa::path(
    get,
    path = "/v1/mcp/export",
    responses((status = 200, body = McpConfigExport)),
    tag = "mcp"
)]
async fn export_mcp_config(
    State(state): State<Arc<AppState>>,
) -> Result<Json<McpConfigExport>, ApiError> {
    Ok(Json(state.mcp.export().await?))
}
