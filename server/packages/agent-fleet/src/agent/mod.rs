//! Agent handles and the runtimes that back them.
//!
//! An [`AgentHandle`] is the in-memory side of one active instance. Each
//! query opens a fresh [`AgentStream`] from the handle's [`AgentRuntime`]; the
//! stream is consumed exactly once and can be cancelled explicitly.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use agent_fleet_error::FleetError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use utoipa::ToSchema;

use crate::config::DEFAULT_MAX_TURNS;
use crate::mcp::McpConfigExport;

mod mock;
mod process;

pub use mock::{MockRuntime, MockStep};
pub use process::ProcessRuntime;

/// One unit of agent output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// Final summary emitted once the agent finished its turn.
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
    },
}

impl AgentEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    #[serde(default, alias = "max_turns", skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    #[serde(default, alias = "system_prompt", skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Everything a runtime needs to run one prompt.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub instance_id: String,
    pub prompt: String,
    pub working_dir: PathBuf,
    /// Overlay applied on top of the server's own environment.
    pub env: BTreeMap<String, String>,
    pub mcp_config: Option<McpConfigExport>,
    pub max_turns: u32,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
}

/// Lazy, finite, single-consumer sequence of agent events.
#[async_trait]
pub trait AgentStream: Send {
    /// Pulls the next event. `None` once the sequence ended normally; an
    /// `Err` ends the sequence with a fault.
    async fn next_event(&mut self) -> Option<Result<AgentEvent, FleetError>>;

    /// Best-effort request to stop the agent. Further `next_event` calls
    /// return `None`.
    async fn cancel(&mut self);
}

pub type BoxAgentStream = Box<dyn AgentStream>;

#[async_trait]
pub trait AgentRuntime: Send + Sync + fmt::Debug {
    async fn open(&self, request: AgentRequest) -> Result<BoxAgentStream, FleetError>;
}

/// Construction parameters for a handle.
#[derive(Debug, Clone)]
pub struct HandleSpec {
    pub instance_id: String,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub mcp_config: Option<McpConfigExport>,
    pub system_prompt: Option<String>,
}

pub struct AgentHandle {
    spec: HandleSpec,
    runtime: Arc<dyn AgentRuntime>,
    active: AtomicBool,
    retired: CancellationToken,
    busy: Arc<tokio::sync::Mutex<()>>,
    current_session: Mutex<Option<String>>,
    started_at: DateTime<Utc>,
}

impl fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHandle")
            .field("instance_id", &self.spec.instance_id)
            .field("working_dir", &self.spec.working_dir)
            .field("active", &self.is_active())
            .field("current_session", &self.current_session())
            .finish()
    }
}

impl AgentHandle {
    pub fn new(spec: HandleSpec, runtime: Arc<dyn AgentRuntime>) -> Self {
        Self {
            spec,
            runtime,
            active: AtomicBool::new(true),
            retired: CancellationToken::new(),
            busy: Arc::new(tokio::sync::Mutex::new(())),
            current_session: Mutex::new(None),
            started_at: Utc::now(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.spec.instance_id
    }

    pub fn working_dir(&self) -> &Path {
        &self.spec.working_dir
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.spec.env
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Takes the handle out of service. A query running on it is interrupted.
    pub(crate) fn mark_inactive(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.retired.cancel();
    }

    /// Resolves once the handle has been taken out of service.
    pub fn retired(&self) -> WaitForCancellationFuture<'_> {
        self.retired.cancelled()
    }

    /// Waits until no query holds the handle.
    pub async fn wait_idle(&self) {
        let _idle = self.busy.lock().await;
    }

    pub fn current_session(&self) -> Option<String> {
        self.current_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.try_lock().is_err()
    }

    /// Claims the handle for one query. Fails with `Busy` instead of waiting.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BusyGuard, FleetError> {
        let permit = self
            .busy
            .clone()
            .try_lock_owned()
            .map_err(|_| FleetError::Busy {
                instance_id: self.spec.instance_id.clone(),
                session_id: self.current_session(),
            })?;
        Ok(BusyGuard {
            handle: self.clone(),
            _permit: permit,
        })
    }

    /// Opens the event stream for `prompt`. Requires the caller to hold the
    /// handle's [`BusyGuard`].
    pub async fn query(
        &self,
        _guard: &BusyGuard,
        prompt: &str,
        options: &QueryOptions,
    ) -> Result<BoxAgentStream, FleetError> {
        if !self.is_active() {
            return Err(FleetError::agent_fault(format!(
                "instance {} is no longer active",
                self.spec.instance_id
            )));
        }
        let request = AgentRequest {
            instance_id: self.spec.instance_id.clone(),
            prompt: prompt.to_string(),
            working_dir: self.spec.working_dir.clone(),
            env: self.spec.env.clone(),
            mcp_config: self.spec.mcp_config.clone(),
            max_turns: options.max_turns.unwrap_or(DEFAULT_MAX_TURNS),
            system_prompt: options
                .system_prompt
                .clone()
                .or_else(|| self.spec.system_prompt.clone()),
            model: options.model.clone(),
        };
        match self.runtime.open(request).await {
            Ok(stream) => Ok(stream),
            Err(err) => {
                // An agent that cannot be launched leaves the handle dead.
                tracing::warn!(
                    instance_id = %self.spec.instance_id,
                    error = %err,
                    "agent failed to start, marking instance inactive"
                );
                self.mark_inactive();
                Err(err)
            }
        }
    }
}

/// Exclusive claim on a handle. Dropping it clears the current session and
/// frees the handle for the next query, on every exit path.
pub struct BusyGuard {
    handle: Arc<AgentHandle>,
    _permit: OwnedMutexGuard<()>,
}

impl fmt::Debug for BusyGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusyGuard")
            .field("instance_id", &self.handle.instance_id())
            .finish()
    }
}

impl BusyGuard {
    pub fn handle(&self) -> &Arc<AgentHandle> {
        &self.handle
    }

    pub(crate) fn set_session(&self, session_id: &str) {
        *self
            .handle
            .current_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(session_id.to_string());
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.handle
            .current_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
