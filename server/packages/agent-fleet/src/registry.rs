//! The single in-memory authority over live agent handles.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use agent_fleet_error::FleetError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::agent::{AgentHandle, AgentRuntime, BusyGuard, HandleSpec, QueryOptions};
use crate::config::FleetConfig;
use crate::mcp::export_for_instance;
use crate::orchestrator::{QueryOrchestrator, QueryOutcome, Relay};
use crate::store::{InstanceFilter, InstanceRecord, InstanceStatus, InstanceStatusUpdate, Store};

/// What the registry needs to bring an instance up.
#[derive(Debug, Clone, Default)]
pub struct InstanceDescriptor {
    pub id: String,
    pub working_directory: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub mcp_servers: Vec<String>,
    pub system_prompt: Option<String>,
}

impl InstanceDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

impl From<&InstanceRecord> for InstanceDescriptor {
    fn from(record: &InstanceRecord) -> Self {
        Self {
            id: record.id.clone(),
            working_directory: record.working_directory.as_ref().map(PathBuf::from),
            env: record.environment_vars.clone(),
            mcp_servers: record.mcp_servers.clone(),
            system_prompt: record.system_prompt.clone(),
        }
    }
}

/// Registry view of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStatus {
    Active,
    Inactive,
    Terminated,
}

#[derive(Debug)]
pub struct InstanceRegistry {
    config: FleetConfig,
    store: Arc<dyn Store>,
    runtime: Arc<dyn AgentRuntime>,
    orchestrator: QueryOrchestrator,
    handles: Mutex<HashMap<String, Arc<AgentHandle>>>,
}

impl InstanceRegistry {
    pub fn new(config: FleetConfig, store: Arc<dyn Store>, runtime: Arc<dyn AgentRuntime>) -> Self {
        let orchestrator = QueryOrchestrator::new(store.clone(), config.query_timeout);
        Self {
            config,
            store,
            runtime,
            orchestrator,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<String, Arc<AgentHandle>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Arc<AgentHandle>> {
        self.handles().get(id).cloned()
    }

    /// Registers a new live handle for `descriptor.id`.
    pub async fn start(&self, descriptor: &InstanceDescriptor) -> Result<Arc<AgentHandle>, FleetError> {
        {
            let handles = self.handles();
            self.check_admission(&handles, &descriptor.id)?;
        }
        let handle = Arc::new(self.build_handle(descriptor).await?);

        {
            let mut handles = self.handles();
            self.check_admission(&handles, &descriptor.id)?;
            handles.insert(descriptor.id.clone(), handle.clone());
        }

        tracing::info!(
            instance_id = %descriptor.id,
            working_dir = %handle.working_dir().display(),
            "instance started"
        );
        self.report_active(&descriptor.id).await;
        Ok(handle)
    }

    /// Stops and forgets the handle. Calling it again, or for an id that was
    /// never started, is a no-op apart from reconciling a stale `active` row.
    pub async fn terminate(&self, id: &str) -> Result<(), FleetError> {
        let removed = self.handles().remove(id);
        match removed {
            Some(handle) => {
                handle.mark_inactive();
                tracing::info!(instance_id = %id, "instance terminated");
                self.report_terminated(id).await;
            }
            None => {
                tracing::debug!(instance_id = %id, "terminate: no live handle");
                let stale = matches!(
                    self.store.get_instance(id).await?,
                    Some(record) if record.status == InstanceStatus::Active
                );
                if stale {
                    self.report_terminated(id).await;
                }
            }
        }
        Ok(())
    }

    /// Replaces any existing handle with a fresh one. The swap happens in a
    /// single critical section, so racing restarts never leave two handles.
    /// A query still running on the old handle is interrupted, and the new
    /// handle stays busy until that query has finished its bookkeeping.
    pub async fn restart(
        &self,
        descriptor: &InstanceDescriptor,
    ) -> Result<Arc<AgentHandle>, FleetError> {
        let handle = Arc::new(self.build_handle(descriptor).await?);
        let draining = handle.try_acquire()?;
        let previous = {
            let mut handles = self.handles();
            let previous = handles.remove(&descriptor.id);
            if handles.len() >= self.config.max_instances {
                if let Some(previous) = previous {
                    handles.insert(descriptor.id.clone(), previous);
                }
                return Err(FleetError::CapacityExceeded {
                    max: self.config.max_instances,
                });
            }
            handles.insert(descriptor.id.clone(), handle.clone());
            previous
        };
        if let Some(previous) = previous {
            previous.mark_inactive();
            previous.wait_idle().await;
        }
        drop(draining);
        tracing::info!(instance_id = %descriptor.id, "instance restarted");
        self.report_active(&descriptor.id).await;
        Ok(handle)
    }

    /// Claims the instance for one query without waiting.
    pub fn acquire(&self, id: &str) -> Result<BusyGuard, FleetError> {
        let handle = self.get(id).ok_or_else(|| FleetError::InstanceNotFound {
            instance_id: id.to_string(),
        })?;
        handle.try_acquire()
    }

    /// Runs a query on an already-claimed handle.
    pub async fn run_query(
        &self,
        guard: BusyGuard,
        prompt: &str,
        options: &QueryOptions,
        relay: Relay,
        cancel: CancellationToken,
    ) -> Result<QueryOutcome, FleetError> {
        self.orchestrator
            .run(guard, prompt, options, relay, cancel)
            .await
    }

    /// Claims the instance and runs one query to completion. The run is a
    /// detached task, so dropping the returned future does not abandon the
    /// session bookkeeping.
    pub async fn query(
        &self,
        id: &str,
        prompt: &str,
        options: &QueryOptions,
        relay: Relay,
    ) -> Result<QueryOutcome, FleetError> {
        let guard = self.acquire(id)?;
        let orchestrator = self.orchestrator.clone();
        let prompt = prompt.to_string();
        let options = options.clone();
        let task = tokio::spawn(async move {
            orchestrator
                .run(guard, &prompt, &options, relay, CancellationToken::new())
                .await
        });
        task.await.map_err(|err| {
            tracing::error!(instance_id = %id, error = %err, "query task failed");
            FleetError::agent_fault(format!("query task failed: {err}"))
        })?
    }

    pub fn status(&self, id: &str) -> RuntimeStatus {
        match self.handles().get(id) {
            Some(handle) if handle.is_active() => RuntimeStatus::Active,
            Some(_) => RuntimeStatus::Inactive,
            None => RuntimeStatus::Terminated,
        }
    }

    /// Drops handles that are no longer live and reports them as `error`.
    /// Terminate and restart remove their handles directly; what is left for
    /// this sweep are handles whose agent failed to launch.
    pub async fn reap_inactive(&self) -> Vec<String> {
        let reaped: Vec<String> = {
            let mut handles = self.handles();
            let dead: Vec<String> = handles
                .iter()
                .filter(|(_, handle)| !handle.is_active())
                .map(|(id, _)| id.clone())
                .collect();
            for id in &dead {
                handles.remove(id);
            }
            dead
        };
        for id in &reaped {
            tracing::info!(instance_id = %id, "reaped inactive instance");
            self.report(
                id,
                InstanceStatusUpdate {
                    status: InstanceStatus::Error,
                    pid: None,
                    terminated_at: None,
                },
            )
            .await;
        }
        reaped
    }

    /// Terminates every live handle.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Arc<AgentHandle>)> = self.handles().drain().collect();
        for (id, handle) in drained {
            handle.mark_inactive();
            self.report_terminated(&id).await;
        }
        tracing::info!("instance registry shut down");
    }

    /// Marks stored `active` rows with no live handle as terminated. Run at
    /// boot, when nothing from a previous process can still be running.
    pub async fn reconcile_stale(&self) -> Result<usize, FleetError> {
        let stored = self
            .store
            .list_instances(InstanceFilter {
                status: Some(InstanceStatus::Active),
                ..InstanceFilter::default()
            })
            .await?;
        let mut reconciled = 0;
        for record in stored {
            if self.get(&record.id).is_some() {
                continue;
            }
            self.report_terminated(&record.id).await;
            reconciled += 1;
        }
        if reconciled > 0 {
            tracing::info!(count = reconciled, "reconciled stale active instances");
        }
        Ok(reconciled)
    }

    fn check_admission(
        &self,
        handles: &HashMap<String, Arc<AgentHandle>>,
        id: &str,
    ) -> Result<(), FleetError> {
        if handles.contains_key(id) {
            return Err(FleetError::AlreadyRunning {
                instance_id: id.to_string(),
            });
        }
        if handles.len() >= self.config.max_instances {
            return Err(FleetError::CapacityExceeded {
                max: self.config.max_instances,
            });
        }
        Ok(())
    }

    async fn build_handle(&self, descriptor: &InstanceDescriptor) -> Result<AgentHandle, FleetError> {
        let working_dir = descriptor
            .working_directory
            .clone()
            .unwrap_or_else(|| self.config.workdir_root.join(&descriptor.id));
        tokio::fs::create_dir_all(&working_dir).await.map_err(|err| {
            FleetError::agent_fault(format!(
                "failed to create working directory {}: {err}",
                working_dir.display()
            ))
        })?;

        let mcp_config = if descriptor.mcp_servers.is_empty() {
            None
        } else {
            let servers = self.store.list_mcp_servers(true).await?;
            let export = export_for_instance(&servers, &descriptor.mcp_servers);
            (!export.is_empty()).then_some(export)
        };

        Ok(AgentHandle::new(
            HandleSpec {
                instance_id: descriptor.id.clone(),
                working_dir,
                env: descriptor.env.clone(),
                mcp_config,
                system_prompt: descriptor.system_prompt.clone(),
            },
            self.runtime.clone(),
        ))
    }

    async fn report_active(&self, id: &str) {
        self.report(
            id,
            InstanceStatusUpdate {
                status: InstanceStatus::Active,
                pid: Some(std::process::id()),
                terminated_at: None,
            },
        )
        .await;
    }

    async fn report_terminated(&self, id: &str) {
        self.report(
            id,
            InstanceStatusUpdate {
                status: InstanceStatus::Terminated,
                pid: None,
                terminated_at: Some(Utc::now()),
            },
        )
        .await;
    }

    async fn report(&self, id: &str, update: InstanceStatusUpdate) {
        if let Err(err) = self.store.set_instance_status(id, update).await {
            tracing::warn!(
                instance_id = %id,
                status = update.status.as_str(),
                error = %err,
                "failed to record instance status"
            );
        }
    }
}
