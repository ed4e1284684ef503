//! Request-level operations: call the registry, persist the result.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use agent_fleet_error::FleetError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::agent::QueryOptions;
use crate::bridge::WatchHub;
use crate::mcp::{export_config, validate_server, McpConfigExport};
use crate::orchestrator::{QueryOutcome, Relay};
use crate::registry::{InstanceDescriptor, InstanceRegistry, RuntimeStatus};
use crate::store::{
    InstanceFilter, InstanceRecord, InstanceStatus, InstanceStatusUpdate, McpServerRecord,
    McpServerType, MessageRecord, ProjectRecord, SessionRecord, SessionStatus, Store,
};

const CLAUDE_MD: &str = "CLAUDE.md";

fn default_branch() -> String {
    "main".to_string()
}

fn default_enabled() -> bool {
    true
}

fn instance_not_found(id: &str) -> FleetError {
    FleetError::InstanceNotFound {
        instance_id: id.to_string(),
    }
}

fn record_not_found(kind: &'static str, id: &str) -> FleetError {
    FleetError::RecordNotFound {
        kind,
        id: id.to_string(),
    }
}

fn require_name(name: &str) -> Result<(), FleetError> {
    if name.trim().is_empty() {
        return Err(FleetError::InvalidRequest {
            message: "name must not be empty".to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    pub name: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub environment_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInstanceRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub environment_vars: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub mcp_servers: Option<Vec<String>>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub prompt: String,
    #[serde(default)]
    pub options: QueryOptions,
}

/// Stored status next to what the registry currently holds.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatusView {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub runtime: RuntimeStatus,
    pub busy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InstanceService {
    store: Arc<dyn Store>,
    registry: Arc<InstanceRegistry>,
    hub: Arc<WatchHub>,
}

impl InstanceService {
    pub fn new(store: Arc<dyn Store>, registry: Arc<InstanceRegistry>, hub: Arc<WatchHub>) -> Self {
        Self {
            store,
            registry,
            hub,
        }
    }

    async fn load(&self, id: &str) -> Result<InstanceRecord, FleetError> {
        self.store
            .get_instance(id)
            .await?
            .ok_or_else(|| instance_not_found(id))
    }

    /// Inserts the row and starts the instance. A failed start leaves the
    /// row behind with status `error`.
    pub async fn create(&self, request: CreateInstanceRequest) -> Result<InstanceRecord, FleetError> {
        require_name(&request.name)?;
        let mut record = InstanceRecord::new(Uuid::new_v4().to_string(), request.name);
        record.project_id = request.project_id;
        record.working_directory = request.working_directory;
        record.environment_vars = request.environment_vars;
        record.mcp_servers = request.mcp_servers;
        record.system_prompt = request.system_prompt;
        let record = self.store.insert_instance(record).await?;

        if let Err(err) = self.registry.start(&InstanceDescriptor::from(&record)).await {
            tracing::warn!(instance_id = %record.id, error = %err, "failed to start instance");
            self.store
                .set_instance_status(
                    &record.id,
                    InstanceStatusUpdate {
                        status: InstanceStatus::Error,
                        pid: None,
                        terminated_at: None,
                    },
                )
                .await?;
            return Err(err);
        }
        self.load(&record.id).await
    }

    pub async fn get(&self, id: &str) -> Result<InstanceRecord, FleetError> {
        self.load(id).await
    }

    pub async fn list(&self, filter: InstanceFilter) -> Result<Vec<InstanceRecord>, FleetError> {
        self.store.list_instances(filter).await
    }

    /// Applies the patch; an active instance is restarted with the new
    /// configuration.
    pub async fn update(
        &self,
        id: &str,
        patch: UpdateInstanceRequest,
    ) -> Result<InstanceRecord, FleetError> {
        let mut record = self.load(id).await?;
        if let Some(name) = patch.name {
            require_name(&name)?;
            record.name = name;
        }
        if let Some(working_directory) = patch.working_directory {
            record.working_directory = Some(working_directory);
        }
        if let Some(env) = patch.environment_vars {
            record.environment_vars = env;
        }
        if let Some(mcp_servers) = patch.mcp_servers {
            record.mcp_servers = mcp_servers;
        }
        if let Some(system_prompt) = patch.system_prompt {
            record.system_prompt = Some(system_prompt);
        }
        record.updated_at = Utc::now();
        let record = self.store.update_instance(record).await?;

        if record.status == InstanceStatus::Active {
            self.registry
                .restart(&InstanceDescriptor::from(&record))
                .await?;
        }
        self.load(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), FleetError> {
        let record = self.load(id).await?;
        if record.status == InstanceStatus::Active || self.registry.get(id).is_some() {
            self.registry.terminate(id).await?;
        }
        self.store.delete_instance(id).await?;
        tracing::info!(instance_id = %id, "instance deleted");
        Ok(())
    }

    pub async fn restart(&self, id: &str) -> Result<InstanceRecord, FleetError> {
        let record = self.load(id).await?;
        self.registry
            .restart(&InstanceDescriptor::from(&record))
            .await?;
        self.load(id).await
    }

    /// Runs a query; live output goes to any watch connections.
    pub async fn query(&self, id: &str, request: QueryRequest) -> Result<QueryOutcome, FleetError> {
        let record = self.load(id).await?;
        if record.status != InstanceStatus::Active {
            return Err(FleetError::InvalidRequest {
                message: format!("instance {id} is not active"),
            });
        }
        if request.prompt.trim().is_empty() {
            return Err(FleetError::InvalidRequest {
                message: "prompt is required".to_string(),
            });
        }
        let relay = Relay::watch(self.hub.senders(id, None));
        self.registry
            .query(id, &request.prompt, &request.options, relay)
            .await
    }

    pub async fn status(&self, id: &str) -> Result<InstanceStatusView, FleetError> {
        let record = self.load(id).await?;
        let handle = self.registry.get(id);
        Ok(InstanceStatusView {
            instance_id: record.id,
            status: record.status,
            runtime: self.registry.status(id),
            busy: handle.as_ref().is_some_and(|handle| handle.is_busy()),
            current_session_id: handle.and_then(|handle| handle.current_session()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionExport {
    pub session_id: String,
    pub instance_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub messages: Vec<MessageRecord>,
}

#[derive(Debug, Clone)]
pub struct SessionService {
    store: Arc<dyn Store>,
}

impl SessionService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Newest first.
    pub async fn list(&self, instance_id: Option<&str>) -> Result<Vec<SessionRecord>, FleetError> {
        self.store.list_sessions(instance_id).await
    }

    pub async fn get(&self, id: &str) -> Result<SessionRecord, FleetError> {
        self.store
            .get_session(id)
            .await?
            .ok_or_else(|| record_not_found("session", id))
    }

    pub async fn messages(&self, id: &str) -> Result<Vec<MessageRecord>, FleetError> {
        self.get(id).await?;
        self.store.list_messages(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), FleetError> {
        if !self.store.delete_session(id).await? {
            return Err(record_not_found("session", id));
        }
        Ok(())
    }

    pub async fn export(&self, id: &str) -> Result<SessionExport, FleetError> {
        let session = self.get(id).await?;
        let messages = self.store.list_messages(id).await?;
        Ok(SessionExport {
            session_id: session.id,
            instance_id: session.instance_id,
            status: session.status,
            started_at: session.started_at,
            ended_at: session.ended_at,
            total_tokens: session.total_tokens,
            total_cost_usd: session.total_cost_usd,
            messages,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateMcpServerRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub server_type: McpServerType,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMcpServerRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub server_type: Option<McpServerType>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct McpService {
    store: Arc<dyn Store>,
}

impl McpService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn create(&self, request: CreateMcpServerRequest) -> Result<McpServerRecord, FleetError> {
        require_name(&request.name)?;
        validate_server(
            request.server_type,
            request.command.as_deref(),
            request.url.as_deref(),
        )?;
        let now = Utc::now();
        self.store
            .insert_mcp_server(McpServerRecord {
                id: Uuid::new_v4().to_string(),
                name: request.name,
                server_type: request.server_type,
                command: request.command,
                url: request.url,
                args: request.args,
                env: request.env,
                enabled: request.enabled,
                created_at: now,
                updated_at: now,
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<McpServerRecord, FleetError> {
        self.store
            .get_mcp_server(id)
            .await?
            .ok_or_else(|| record_not_found("mcp server", id))
    }

    pub async fn list(&self, enabled_only: bool) -> Result<Vec<McpServerRecord>, FleetError> {
        self.store.list_mcp_servers(enabled_only).await
    }

    pub async fn update(
        &self,
        id: &str,
        patch: UpdateMcpServerRequest,
    ) -> Result<McpServerRecord, FleetError> {
        let mut server = self.get(id).await?;
        if let Some(name) = patch.name {
            require_name(&name)?;
            server.name = name;
        }
        if let Some(server_type) = patch.server_type {
            server.server_type = server_type;
        }
        if patch.command.is_some() {
            server.command = patch.command;
        }
        if patch.url.is_some() {
            server.url = patch.url;
        }
        if let Some(args) = patch.args {
            server.args = args;
        }
        if let Some(env) = patch.env {
            server.env = env;
        }
        if let Some(enabled) = patch.enabled {
            server.enabled = enabled;
        }
        validate_server(
            server.server_type,
            server.command.as_deref(),
            server.url.as_deref(),
        )?;
        server.updated_at = Utc::now();
        self.store.update_mcp_server(server).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), FleetError> {
        if !self.store.delete_mcp_server(id).await? {
            return Err(record_not_found("mcp server", id));
        }
        Ok(())
    }

    /// Flips the enabled flag and returns the updated record.
    pub async fn toggle(&self, id: &str) -> Result<McpServerRecord, FleetError> {
        let mut server = self.get(id).await?;
        server.enabled = !server.enabled;
        server.updated_at = Utc::now();
        self.store.update_mcp_server(server).await
    }

    pub async fn export(&self) -> Result<McpConfigExport, FleetError> {
        let servers = self.store.list_mcp_servers(true).await?;
        Ok(export_config(&servers))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub path: String,
    #[serde(default)]
    pub git_url: Option<String>,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default)]
    pub claude_md_content: Option<String>,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProjectRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub git_url: Option<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub claude_md_content: Option<String>,
    #[serde(default)]
    pub settings: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone)]
pub struct ProjectService {
    store: Arc<dyn Store>,
    registry: Arc<InstanceRegistry>,
}

impl ProjectService {
    pub fn new(store: Arc<dyn Store>, registry: Arc<InstanceRegistry>) -> Self {
        Self { store, registry }
    }

    /// The project path must exist. Without explicit content, an existing
    /// `CLAUDE.md` in the project root is picked up.
    pub async fn create(&self, request: CreateProjectRequest) -> Result<ProjectRecord, FleetError> {
        require_name(&request.name)?;
        let root = Path::new(&request.path);
        if !tokio::fs::try_exists(root).await.unwrap_or(false) {
            return Err(FleetError::InvalidRequest {
                message: format!("path {} does not exist", request.path),
            });
        }
        let claude_md_content = match request.claude_md_content {
            Some(content) => Some(content),
            None => tokio::fs::read_to_string(root.join(CLAUDE_MD)).await.ok(),
        };
        let now = Utc::now();
        self.store
            .insert_project(ProjectRecord {
                id: Uuid::new_v4().to_string(),
                name: request.name,
                description: request.description,
                path: request.path,
                git_url: request.git_url,
                default_branch: request.default_branch,
                claude_md_content,
                settings: request.settings,
                created_at: now,
                updated_at: now,
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<ProjectRecord, FleetError> {
        self.store
            .get_project(id)
            .await?
            .ok_or_else(|| record_not_found("project", id))
    }

    pub async fn list(&self) -> Result<Vec<ProjectRecord>, FleetError> {
        self.store.list_projects().await
    }

    /// New `CLAUDE.md` content is also written to the project root.
    pub async fn update(
        &self,
        id: &str,
        patch: UpdateProjectRequest,
    ) -> Result<ProjectRecord, FleetError> {
        let mut project = self.get(id).await?;
        if let Some(name) = patch.name {
            require_name(&name)?;
            project.name = name;
        }
        if patch.description.is_some() {
            project.description = patch.description;
        }
        if patch.git_url.is_some() {
            project.git_url = patch.git_url;
        }
        if let Some(branch) = patch.default_branch {
            project.default_branch = branch;
        }
        if let Some(settings) = patch.settings {
            project.settings = settings;
        }
        if let Some(content) = patch.claude_md_content {
            let target = Path::new(&project.path).join(CLAUDE_MD);
            tokio::fs::write(&target, &content).await.map_err(|err| {
                FleetError::storage(format!("failed to write {}: {err}", target.display()))
            })?;
            project.claude_md_content = Some(content);
        }
        project.updated_at = Utc::now();
        self.store.update_project(project).await
    }

    /// Terminates the project's live instances, then deletes everything below
    /// the project.
    pub async fn delete(&self, id: &str) -> Result<(), FleetError> {
        self.get(id).await?;
        let instances = self
            .store
            .list_instances(InstanceFilter {
                project_id: Some(id.to_string()),
                status: None,
            })
            .await?;
        for instance in instances {
            if self.registry.get(&instance.id).is_some() {
                self.registry.terminate(&instance.id).await?;
            }
        }
        self.store.delete_project(id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::agent::MockRuntime;
    use crate::config::FleetConfig;
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: Arc<InstanceRegistry>,
        instances: InstanceService,
        root: tempfile::TempDir,
    }

    fn fixture(max_instances: usize) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let config = FleetConfig {
            max_instances,
            workdir_root: root.path().join("workspaces"),
            query_timeout: Duration::from_secs(5),
            ..FleetConfig::default()
        };
        let registry = Arc::new(InstanceRegistry::new(
            config,
            store.clone(),
            Arc::new(MockRuntime::echo_with_delay(Duration::ZERO)),
        ));
        let instances =
            InstanceService::new(store.clone(), registry.clone(), Arc::new(WatchHub::new()));
        Fixture {
            store,
            registry,
            instances,
            root,
        }
    }

    fn create_request(name: &str) -> CreateInstanceRequest {
        CreateInstanceRequest {
            name: name.to_string(),
            project_id: None,
            working_directory: None,
            environment_vars: BTreeMap::new(),
            mcp_servers: Vec::new(),
            system_prompt: None,
        }
    }

    #[tokio::test]
    async fn create_starts_the_instance() {
        let fx = fixture(2);
        let record = fx.instances.create(create_request("alpha")).await.unwrap();
        assert_eq!(record.status, InstanceStatus::Active);
        assert_eq!(fx.registry.status(&record.id), RuntimeStatus::Active);
    }

    #[tokio::test]
    async fn failed_start_leaves_error_row() {
        let fx = fixture(1);
        fx.instances.create(create_request("first")).await.unwrap();
        let err = fx.instances.create(create_request("second")).await.unwrap_err();
        assert!(matches!(err, FleetError::CapacityExceeded { max: 1 }));

        let rows = fx
            .instances
            .list(InstanceFilter {
                project_id: None,
                status: Some(InstanceStatus::Error),
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "second");
        assert_eq!(fx.registry.len(), 1);
    }

    #[tokio::test]
    async fn update_restarts_active_instance() {
        let fx = fixture(2);
        let record = fx.instances.create(create_request("alpha")).await.unwrap();
        let before = fx.registry.get(&record.id).unwrap();

        let mut env = BTreeMap::new();
        env.insert("MODE".to_string(), "fast".to_string());
        let updated = fx
            .instances
            .update(
                &record.id,
                UpdateInstanceRequest {
                    environment_vars: Some(env),
                    ..UpdateInstanceRequest::default()
                },
            )
            .await
            .unwrap();

        let after = fx.registry.get(&record.id).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.env().get("MODE").map(String::as_str), Some("fast"));
        assert_eq!(updated.status, InstanceStatus::Active);
    }

    #[tokio::test]
    async fn delete_terminates_and_cascades() {
        let fx = fixture(2);
        let record = fx.instances.create(create_request("alpha")).await.unwrap();
        let outcome = fx
            .instances
            .query(
                &record.id,
                QueryRequest {
                    prompt: "hello".to_string(),
                    options: QueryOptions::default(),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.response(), Some("mock: hello"));

        fx.instances.delete(&record.id).await.unwrap();
        assert!(fx.registry.get(&record.id).is_none());
        assert!(fx.store.get_instance(&record.id).await.unwrap().is_none());
        assert!(fx
            .store
            .get_session(&outcome.session_id)
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            fx.instances.get(&record.id).await,
            Err(FleetError::InstanceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn query_requires_active_row() {
        let fx = fixture(2);
        let record = fx.instances.create(create_request("alpha")).await.unwrap();
        fx.registry.terminate(&record.id).await.unwrap();
        let err = fx
            .instances
            .query(
                &record.id,
                QueryRequest {
                    prompt: "hello".to_string(),
                    options: QueryOptions::default(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn session_export_orders_messages() {
        let fx = fixture(2);
        let sessions = SessionService::new(fx.store.clone());
        let record = fx.instances.create(create_request("alpha")).await.unwrap();
        let outcome = fx
            .instances
            .query(
                &record.id,
                QueryRequest {
                    prompt: "hello there".to_string(),
                    options: QueryOptions::default(),
                },
            )
            .await
            .unwrap();

        let export = sessions.export(&outcome.session_id).await.unwrap();
        assert_eq!(export.status, SessionStatus::Completed);
        let contents: Vec<&str> = export.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hello there", "mock: hello there"]);

        sessions.delete(&outcome.session_id).await.unwrap();
        assert!(matches!(
            sessions.get(&outcome.session_id).await,
            Err(FleetError::RecordNotFound { kind: "session", .. })
        ));
    }

    #[tokio::test]
    async fn mcp_toggle_and_validation() {
        let fx = fixture(1);
        let mcp = McpService::new(fx.store.clone());
        let invalid = mcp
            .create(CreateMcpServerRequest {
                name: "fs".to_string(),
                server_type: McpServerType::Stdio,
                command: None,
                url: None,
                args: Vec::new(),
                env: BTreeMap::new(),
                enabled: true,
            })
            .await;
        assert!(matches!(invalid, Err(FleetError::InvalidRequest { .. })));

        let server = mcp
            .create(CreateMcpServerRequest {
                name: "fs".to_string(),
                server_type: McpServerType::Stdio,
                command: Some("mcp-fs".to_string()),
                url: None,
                args: Vec::new(),
                env: BTreeMap::new(),
                enabled: true,
            })
            .await
            .unwrap();
        assert_eq!(mcp.export().await.unwrap().servers.len(), 1);

        let toggled = mcp.toggle(&server.id).await.unwrap();
        assert!(!toggled.enabled);
        assert!(mcp.export().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn project_create_reads_claude_md() {
        let fx = fixture(1);
        let projects = ProjectService::new(fx.store.clone(), fx.registry.clone());
        let project_dir = fx.root.path().join("repo");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(project_dir.join(CLAUDE_MD), "# rules").unwrap();

        let project = projects
            .create(CreateProjectRequest {
                name: "repo".to_string(),
                description: None,
                path: project_dir.to_string_lossy().into_owned(),
                git_url: None,
                default_branch: default_branch(),
                claude_md_content: None,
                settings: BTreeMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(project.claude_md_content.as_deref(), Some("# rules"));

        let updated = projects
            .update(
                &project.id,
                UpdateProjectRequest {
                    claude_md_content: Some("# new rules".to_string()),
                    ..UpdateProjectRequest::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.claude_md_content.as_deref(), Some("# new rules"));
        assert_eq!(
            std::fs::read_to_string(project_dir.join(CLAUDE_MD)).unwrap(),
            "# new rules"
        );

        let missing = projects
            .create(CreateProjectRequest {
                name: "ghost".to_string(),
                description: None,
                path: fx.root.path().join("nope").to_string_lossy().into_owned(),
                git_url: None,
                default_branch: default_branch(),
                claude_md_content: None,
                settings: BTreeMap::new(),
            })
            .await;
        assert!(matches!(missing, Err(FleetError::InvalidRequest { .. })));
    }

    #[tokio::test]
    async fn project_delete_terminates_instances() {
        let fx = fixture(2);
        let projects = ProjectService::new(fx.store.clone(), fx.registry.clone());
        let project = projects
            .create(CreateProjectRequest {
                name: "repo".to_string(),
                description: None,
                path: fx.root.path().to_string_lossy().into_owned(),
                git_url: None,
                default_branch: default_branch(),
                claude_md_content: Some(String::new()),
                settings: BTreeMap::new(),
            })
            .await
            .unwrap();
        let mut request = create_request("alpha");
        request.project_id = Some(project.id.clone());
        let instance = fx.instances.create(request).await.unwrap();

        projects.delete(&project.id).await.unwrap();
        assert!(fx.registry.is_empty());
        assert!(fx.store.get_instance(&instance.id).await.unwrap().is_none());
    }
}
