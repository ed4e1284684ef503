//! Persisted records and the storage collaborator the control plane writes to.

use std::collections::BTreeMap;

use agent_fleet_error::FleetError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

mod memory;

pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Inactive,
    Active,
    Error,
    Terminated,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Error => "error",
            Self::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum McpServerType {
    Stdio,
    Http,
    Sse,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_url: Option<String>,
    pub default_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_md_content: Option<String>,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub environment_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            status: InstanceStatus::Inactive,
            pid: None,
            project_id: None,
            working_directory: None,
            environment_vars: BTreeMap::new(),
            mcp_servers: Vec::new(),
            system_prompt: None,
            created_at: now,
            updated_at: now,
            terminated_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub instance_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: i64,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
}

/// A message before the store assigns its id.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub tokens: Option<u64>,
    pub cost_usd: Option<f64>,
    pub tool_calls: Option<Vec<Value>>,
}

impl NewMessage {
    pub fn new(session_id: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tokens: None,
            cost_usd: None,
            tool_calls: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct McpServerRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub server_type: McpServerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle fields the registry reports after a transition.
#[derive(Debug, Clone, Copy)]
pub struct InstanceStatusUpdate {
    pub status: InstanceStatus,
    pub pid: Option<u32>,
    pub terminated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub project_id: Option<String>,
    pub status: Option<InstanceStatus>,
}

/// Key-based storage for projects, instances, sessions, messages and MCP
/// server configs. Every call commits before it returns; there is no
/// transactional coupling across calls.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    async fn insert_project(&self, project: ProjectRecord) -> Result<ProjectRecord, FleetError>;
    async fn get_project(&self, id: &str) -> Result<Option<ProjectRecord>, FleetError>;
    async fn list_projects(&self) -> Result<Vec<ProjectRecord>, FleetError>;
    async fn update_project(&self, project: ProjectRecord) -> Result<ProjectRecord, FleetError>;
    /// Deletes the project and every instance, session and message below it.
    async fn delete_project(&self, id: &str) -> Result<bool, FleetError>;

    async fn insert_instance(&self, instance: InstanceRecord)
        -> Result<InstanceRecord, FleetError>;
    async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>, FleetError>;
    async fn list_instances(&self, filter: InstanceFilter)
        -> Result<Vec<InstanceRecord>, FleetError>;
    async fn update_instance(&self, instance: InstanceRecord)
        -> Result<InstanceRecord, FleetError>;
    async fn set_instance_status(
        &self,
        id: &str,
        update: InstanceStatusUpdate,
    ) -> Result<InstanceRecord, FleetError>;
    /// Deletes the instance and its sessions and messages.
    async fn delete_instance(&self, id: &str) -> Result<bool, FleetError>;
    async fn delete_terminated_instances_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, FleetError>;

    async fn insert_session(&self, session: SessionRecord) -> Result<SessionRecord, FleetError>;
    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, FleetError>;
    /// Newest first.
    async fn list_sessions(&self, instance_id: Option<&str>)
        -> Result<Vec<SessionRecord>, FleetError>;
    async fn update_session(&self, session: SessionRecord) -> Result<SessionRecord, FleetError>;
    async fn delete_session(&self, id: &str) -> Result<bool, FleetError>;
    async fn delete_sessions_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, FleetError>;

    async fn append_message(&self, message: NewMessage) -> Result<MessageRecord, FleetError>;
    /// Ordered by timestamp, then id.
    async fn list_messages(&self, session_id: &str) -> Result<Vec<MessageRecord>, FleetError>;

    async fn insert_mcp_server(&self, server: McpServerRecord)
        -> Result<McpServerRecord, FleetError>;
    async fn get_mcp_server(&self, id: &str) -> Result<Option<McpServerRecord>, FleetError>;
    async fn list_mcp_servers(&self, enabled_only: bool)
        -> Result<Vec<McpServerRecord>, FleetError>;
    async fn update_mcp_server(&self, server: McpServerRecord)
        -> Result<McpServerRecord, FleetError>;
    async fn delete_mcp_server(&self, id: &str) -> Result<bool, FleetError>;
}
