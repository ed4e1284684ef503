use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use agent_fleet_error::FleetError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    InstanceFilter, InstanceRecord, InstanceStatus, InstanceStatusUpdate, McpServerRecord,
    MessageRecord, NewMessage, ProjectRecord, SessionRecord, Store,
};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Tables {
    projects: BTreeMap<String, ProjectRecord>,
    instances: BTreeMap<String, InstanceRecord>,
    sessions: BTreeMap<String, SessionRecord>,
    messages: Vec<MessageRecord>,
    mcp_servers: BTreeMap<String, McpServerRecord>,
    next_message_id: i64,
}

impl Tables {
    fn remove_session_cascade(&mut self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        self.messages.retain(|message| message.session_id != session_id);
        removed
    }

    fn remove_instance_cascade(&mut self, instance_id: &str) -> bool {
        let removed = self.instances.remove(instance_id).is_some();
        let session_ids: Vec<String> = self
            .sessions
            .values()
            .filter(|session| session.instance_id == instance_id)
            .map(|session| session.id.clone())
            .collect();
        for session_id in session_ids {
            self.remove_session_cascade(&session_id);
        }
        removed
    }
}

/// In-process store. When opened with a state file, every mutation rewrites
/// the file with a JSON snapshot of all tables.
#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    state_path: Option<PathBuf>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                next_message_id: 1,
                ..Tables::default()
            }),
            state_path: None,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Opens a store backed by `path`, loading the previous snapshot if one
    /// exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FleetError> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(FleetError::storage)?;
            let mut tables: Tables =
                serde_json::from_str(&content).map_err(FleetError::storage)?;
            let max_id = tables.messages.iter().map(|m| m.id).max().unwrap_or(0);
            tables.next_message_id = tables.next_message_id.max(max_id + 1);
            tables
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(FleetError::storage)?;
            }
            Tables {
                next_message_id: 1,
                ..Tables::default()
            }
        };

        Ok(Self {
            tables: Mutex::new(tables),
            state_path: Some(path),
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn mutate<R>(
        &self,
        edit: impl FnOnce(&mut Tables) -> Result<R, FleetError>,
    ) -> Result<R, FleetError> {
        let result = {
            let mut tables = self.tables();
            edit(&mut tables)?
        };
        self.persist().await?;
        Ok(result)
    }

    async fn persist(&self) -> Result<(), FleetError> {
        let Some(path) = self.state_path.as_ref() else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let content = {
            let tables = self.tables();
            serde_json::to_string_pretty(&*tables).map_err(FleetError::storage)?
        };
        tokio::fs::write(path, content)
            .await
            .map_err(FleetError::storage)
    }
}

fn not_found(kind: &'static str, id: &str) -> FleetError {
    FleetError::RecordNotFound {
        kind,
        id: id.to_string(),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_project(&self, project: ProjectRecord) -> Result<ProjectRecord, FleetError> {
        self.mutate(|tables| {
            tables.projects.insert(project.id.clone(), project.clone());
            Ok(project)
        })
        .await
    }

    async fn get_project(&self, id: &str) -> Result<Option<ProjectRecord>, FleetError> {
        Ok(self.tables().projects.get(id).cloned())
    }

    async fn list_projects(&self) -> Result<Vec<ProjectRecord>, FleetError> {
        let mut projects: Vec<ProjectRecord> = self.tables().projects.values().cloned().collect();
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(projects)
    }

    async fn update_project(&self, mut project: ProjectRecord) -> Result<ProjectRecord, FleetError> {
        self.mutate(|tables| {
            let slot = tables
                .projects
                .get_mut(&project.id)
                .ok_or_else(|| not_found("project", &project.id))?;
            project.updated_at = Utc::now();
            *slot = project.clone();
            Ok(project)
        })
        .await
    }

    async fn delete_project(&self, id: &str) -> Result<bool, FleetError> {
        self.mutate(|tables| {
            let removed = tables.projects.remove(id).is_some();
            let instance_ids: Vec<String> = tables
                .instances
                .values()
                .filter(|instance| instance.project_id.as_deref() == Some(id))
                .map(|instance| instance.id.clone())
                .collect();
            for instance_id in instance_ids {
                tables.remove_instance_cascade(&instance_id);
            }
            Ok(removed)
        })
        .await
    }

    async fn insert_instance(
        &self,
        instance: InstanceRecord,
    ) -> Result<InstanceRecord, FleetError> {
        self.mutate(|tables| {
            if let Some(project_id) = instance.project_id.as_deref() {
                if !tables.projects.contains_key(project_id) {
                    return Err(not_found("project", project_id));
                }
            }
            tables.instances.insert(instance.id.clone(), instance.clone());
            Ok(instance)
        })
        .await
    }

    async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>, FleetError> {
        Ok(self.tables().instances.get(id).cloned())
    }

    async fn list_instances(
        &self,
        filter: InstanceFilter,
    ) -> Result<Vec<InstanceRecord>, FleetError> {
        let mut instances: Vec<InstanceRecord> = self
            .tables()
            .instances
            .values()
            .filter(|instance| {
                filter
                    .project_id
                    .as_deref()
                    .map_or(true, |project_id| instance.project_id.as_deref() == Some(project_id))
            })
            .filter(|instance| filter.status.map_or(true, |status| instance.status == status))
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(instances)
    }

    async fn update_instance(
        &self,
        mut instance: InstanceRecord,
    ) -> Result<InstanceRecord, FleetError> {
        self.mutate(|tables| {
            let slot = tables
                .instances
                .get_mut(&instance.id)
                .ok_or_else(|| not_found("instance", &instance.id))?;
            instance.updated_at = Utc::now();
            *slot = instance.clone();
            Ok(instance)
        })
        .await
    }

    async fn set_instance_status(
        &self,
        id: &str,
        update: InstanceStatusUpdate,
    ) -> Result<InstanceRecord, FleetError> {
        self.mutate(|tables| {
            let instance = tables
                .instances
                .get_mut(id)
                .ok_or_else(|| not_found("instance", id))?;
            instance.status = update.status;
            instance.pid = update.pid;
            if update.status == InstanceStatus::Active {
                instance.terminated_at = None;
            }
            if update.terminated_at.is_some() {
                instance.terminated_at = update.terminated_at;
            }
            instance.updated_at = Utc::now();
            Ok(instance.clone())
        })
        .await
    }

    async fn delete_instance(&self, id: &str) -> Result<bool, FleetError> {
        self.mutate(|tables| Ok(tables.remove_instance_cascade(id)))
            .await
    }

    async fn delete_terminated_instances_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, FleetError> {
        self.mutate(|tables| {
            let expired: Vec<String> = tables
                .instances
                .values()
                .filter(|instance| instance.status == InstanceStatus::Terminated)
                .filter(|instance| instance.terminated_at.is_some_and(|at| at < cutoff))
                .map(|instance| instance.id.clone())
                .collect();
            for instance_id in &expired {
                tables.remove_instance_cascade(instance_id);
            }
            Ok(expired.len())
        })
        .await
    }

    async fn insert_session(&self, session: SessionRecord) -> Result<SessionRecord, FleetError> {
        self.mutate(|tables| {
            if !tables.instances.contains_key(&session.instance_id) {
                return Err(not_found("instance", &session.instance_id));
            }
            tables.sessions.insert(session.id.clone(), session.clone());
            Ok(session)
        })
        .await
    }

    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, FleetError> {
        Ok(self.tables().sessions.get(id).cloned())
    }

    async fn list_sessions(
        &self,
        instance_id: Option<&str>,
    ) -> Result<Vec<SessionRecord>, FleetError> {
        let mut sessions: Vec<SessionRecord> = self
            .tables()
            .sessions
            .values()
            .filter(|session| instance_id.map_or(true, |id| session.instance_id == id))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(sessions)
    }

    async fn update_session(&self, session: SessionRecord) -> Result<SessionRecord, FleetError> {
        self.mutate(|tables| {
            let slot = tables
                .sessions
                .get_mut(&session.id)
                .ok_or_else(|| not_found("session", &session.id))?;
            *slot = session.clone();
            Ok(session)
        })
        .await
    }

    async fn delete_session(&self, id: &str) -> Result<bool, FleetError> {
        self.mutate(|tables| Ok(tables.remove_session_cascade(id)))
            .await
    }

    async fn delete_sessions_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, FleetError> {
        self.mutate(|tables| {
            let expired: Vec<String> = tables
                .sessions
                .values()
                .filter(|session| session.started_at < cutoff)
                .map(|session| session.id.clone())
                .collect();
            for session_id in &expired {
                tables.remove_session_cascade(session_id);
            }
            Ok(expired.len())
        })
        .await
    }

    async fn append_message(&self, message: NewMessage) -> Result<MessageRecord, FleetError> {
        self.mutate(|tables| {
            if !tables.sessions.contains_key(&message.session_id) {
                return Err(not_found("session", &message.session_id));
            }
            let record = MessageRecord {
                id: tables.next_message_id,
                session_id: message.session_id,
                role: message.role,
                content: message.content,
                timestamp: message.timestamp,
                tokens: message.tokens,
                cost_usd: message.cost_usd,
                tool_calls: message.tool_calls,
            };
            tables.next_message_id += 1;
            tables.messages.push(record.clone());
            Ok(record)
        })
        .await
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<MessageRecord>, FleetError> {
        let mut messages: Vec<MessageRecord> = self
            .tables()
            .messages
            .iter()
            .filter(|message| message.session_id == session_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(messages)
    }

    async fn insert_mcp_server(
        &self,
        server: McpServerRecord,
    ) -> Result<McpServerRecord, FleetError> {
        self.mutate(|tables| {
            tables.mcp_servers.insert(server.id.clone(), server.clone());
            Ok(server)
        })
        .await
    }

    async fn get_mcp_server(&self, id: &str) -> Result<Option<McpServerRecord>, FleetError> {
        Ok(self.tables().mcp_servers.get(id).cloned())
    }

    async fn list_mcp_servers(
        &self,
        enabled_only: bool,
    ) -> Result<Vec<McpServerRecord>, FleetError> {
        let mut servers: Vec<McpServerRecord> = self
            .tables()
            .mcp_servers
            .values()
            .filter(|server| !enabled_only || server.enabled)
            .cloned()
            .collect();
        servers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(servers)
    }

    async fn update_mcp_server(
        &self,
        mut server: McpServerRecord,
    ) -> Result<McpServerRecord, FleetError> {
        self.mutate(|tables| {
            let slot = tables
                .mcp_servers
                .get_mut(&server.id)
                .ok_or_else(|| not_found("mcp server", &server.id))?;
            server.updated_at = Utc::now();
            *slot = server.clone();
            Ok(server)
        })
        .await
    }

    async fn delete_mcp_server(&self, id: &str) -> Result<bool, FleetError> {
        self.mutate(|tables| Ok(tables.mcp_servers.remove(id).is_some()))
            .await
    }
}
