use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_INSTANCES: usize = 5;
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3_600;
pub const DEFAULT_MAX_SESSION_AGE_DAYS: i64 = 30;
pub const DEFAULT_AGENT_BIN: &str = "claude";
pub const DEFAULT_MAX_TURNS: u32 = 10;

/// Static settings read once at process start.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub max_instances: usize,
    /// Instances without an explicit working directory get `<root>/<id>`.
    pub workdir_root: PathBuf,
    pub query_timeout: Duration,
    pub cleanup_interval: Duration,
    pub max_session_age_days: i64,
    pub agent_bin: PathBuf,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_instances: DEFAULT_MAX_INSTANCES,
            workdir_root: PathBuf::from("workspaces"),
            query_timeout: Duration::from_millis(DEFAULT_QUERY_TIMEOUT_MS),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
            max_session_age_days: DEFAULT_MAX_SESSION_AGE_DAYS,
            agent_bin: PathBuf::from(DEFAULT_AGENT_BIN),
        }
    }
}

/// Default location for the JSON state snapshot.
pub fn default_state_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("agent-fleet").join("state.json"))
        .unwrap_or_else(|| PathBuf::from(".").join(".agent-fleet").join("state.json"))
}
