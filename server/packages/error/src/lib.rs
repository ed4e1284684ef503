use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    CapacityExceeded,
    AlreadyRunning,
    InstanceNotFound,
    RecordNotFound,
    Busy,
    AgentFault,
    QueryFailed,
    TransportClosed,
    Storage,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:agent-fleet:error:invalid_request",
            Self::CapacityExceeded => "urn:agent-fleet:error:capacity_exceeded",
            Self::AlreadyRunning => "urn:agent-fleet:error:already_running",
            Self::InstanceNotFound => "urn:agent-fleet:error:instance_not_found",
            Self::RecordNotFound => "urn:agent-fleet:error:record_not_found",
            Self::Busy => "urn:agent-fleet:error:busy",
            Self::AgentFault => "urn:agent-fleet:error:agent_fault",
            Self::QueryFailed => "urn:agent-fleet:error:query_failed",
            Self::TransportClosed => "urn:agent-fleet:error:transport_closed",
            Self::Storage => "urn:agent-fleet:error:storage",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::CapacityExceeded => "Capacity Exceeded",
            Self::AlreadyRunning => "Already Running",
            Self::InstanceNotFound => "Instance Not Found",
            Self::RecordNotFound => "Record Not Found",
            Self::Busy => "Instance Busy",
            Self::AgentFault => "Agent Fault",
            Self::QueryFailed => "Query Failed",
            Self::TransportClosed => "Transport Closed",
            Self::Storage => "Storage Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::CapacityExceeded => 429,
            Self::AlreadyRunning => 409,
            Self::InstanceNotFound => 404,
            Self::RecordNotFound => 404,
            Self::Busy => 409,
            Self::AgentFault => 502,
            Self::QueryFailed => 502,
            Self::TransportClosed => 410,
            Self::Storage => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// Why a query did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryFailure {
    /// The agent runtime faulted; carries the fault message.
    Fault(String),
    /// The query exceeded the configured maximum duration.
    Timeout { limit_ms: u64 },
}

impl std::fmt::Display for QueryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fault(message) => write!(f, "{message}"),
            Self::Timeout { limit_ms } => write!(f, "timed out after {limit_ms}ms"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum FleetError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("maximum number of instances ({max}) reached")]
    CapacityExceeded { max: usize },
    #[error("instance already running: {instance_id}")]
    AlreadyRunning { instance_id: String },
    #[error("instance not found: {instance_id}")]
    InstanceNotFound { instance_id: String },
    #[error("{kind} not found: {id}")]
    RecordNotFound { kind: &'static str, id: String },
    #[error("instance busy: {instance_id}")]
    Busy {
        instance_id: String,
        session_id: Option<String>,
    },
    #[error("agent fault: {message}")]
    AgentFault {
        message: String,
        exit_code: Option<i32>,
        stderr: Option<String>,
    },
    #[error("query failed for session {session_id}: {failure}")]
    QueryFailed {
        instance_id: String,
        session_id: String,
        failure: QueryFailure,
    },
    #[error("client transport closed")]
    TransportClosed,
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl FleetError {
    pub fn agent_fault(message: impl Into<String>) -> Self {
        Self::AgentFault {
            message: message.into(),
            exit_code: None,
            stderr: None,
        }
    }

    pub fn storage(message: impl std::fmt::Display) -> Self {
        Self::Storage {
            message: message.to_string(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::CapacityExceeded { .. } => ErrorType::CapacityExceeded,
            Self::AlreadyRunning { .. } => ErrorType::AlreadyRunning,
            Self::InstanceNotFound { .. } => ErrorType::InstanceNotFound,
            Self::RecordNotFound { .. } => ErrorType::RecordNotFound,
            Self::Busy { .. } => ErrorType::Busy,
            Self::AgentFault { .. } => ErrorType::AgentFault,
            Self::QueryFailed { .. } => ErrorType::QueryFailed,
            Self::TransportClosed => ErrorType::TransportClosed,
            Self::Storage { .. } => ErrorType::Storage,
        }
    }

    /// Registry-level outcomes that callers branch on. These are never
    /// logged as incidents.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. }
                | Self::AlreadyRunning { .. }
                | Self::InstanceNotFound { .. }
                | Self::Busy { .. }
                | Self::TransportClosed
        )
    }

    fn extensions(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Self::CapacityExceeded { max } => {
                map.insert("maxInstances".to_string(), Value::from(*max as u64));
            }
            Self::AlreadyRunning { instance_id } | Self::InstanceNotFound { instance_id } => {
                map.insert("instanceId".to_string(), Value::String(instance_id.clone()));
            }
            Self::RecordNotFound { kind, id } => {
                map.insert("kind".to_string(), Value::String(kind.to_string()));
                map.insert("id".to_string(), Value::String(id.clone()));
            }
            Self::Busy {
                instance_id,
                session_id,
            } => {
                map.insert("instanceId".to_string(), Value::String(instance_id.clone()));
                if let Some(session_id) = session_id {
                    map.insert("sessionId".to_string(), Value::String(session_id.clone()));
                }
            }
            Self::AgentFault {
                exit_code, stderr, ..
            } => {
                if let Some(code) = exit_code {
                    map.insert(
                        "exitCode".to_string(),
                        Value::Number(serde_json::Number::from(*code as i64)),
                    );
                }
                if let Some(stderr) = stderr {
                    map.insert("stderr".to_string(), Value::String(stderr.clone()));
                }
            }
            Self::QueryFailed {
                instance_id,
                session_id,
                failure,
            } => {
                map.insert("instanceId".to_string(), Value::String(instance_id.clone()));
                map.insert("sessionId".to_string(), Value::String(session_id.clone()));
                if let QueryFailure::Timeout { limit_ms } = failure {
                    map.insert("timeoutMs".to_string(), Value::from(*limit_ms));
                }
            }
            Self::InvalidRequest { .. } | Self::TransportClosed | Self::Storage { .. } => {}
        }
        map
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        problem.extensions = self.extensions();
        problem
    }
}

impl From<FleetError> for ProblemDetails {
    fn from(value: FleetError) -> Self {
        value.to_problem_details()
    }
}

impl From<&FleetError> for ProblemDetails {
    fn from(value: &FleetError) -> Self {
        value.to_problem_details()
    }
}
