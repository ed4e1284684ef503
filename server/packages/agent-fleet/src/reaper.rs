use std::sync::Arc;
use std::time::Duration;

use agent_fleet_error::FleetError;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::registry::InstanceRegistry;
use crate::store::Store;

/// Terminated rows are kept this long before deletion.
const TERMINATED_RETENTION_HOURS: i64 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub reaped_instances: Vec<String>,
    pub expired_sessions: usize,
    pub deleted_instances: usize,
}

#[derive(Debug, Clone)]
pub struct Reaper {
    registry: Arc<InstanceRegistry>,
    store: Arc<dyn Store>,
    interval: Duration,
    max_session_age: chrono::Duration,
}

impl Reaper {
    pub fn new(registry: Arc<InstanceRegistry>, store: Arc<dyn Store>) -> Self {
        let config = registry.config();
        Self {
            interval: config.cleanup_interval,
            max_session_age: chrono::Duration::days(config.max_session_age_days),
            registry,
            store,
        }
    }

    /// One cleanup pass.
    pub async fn run_once(&self) -> Result<ReapReport, FleetError> {
        let now = Utc::now();
        let reaped_instances = self.registry.reap_inactive().await;
        let expired_sessions = self
            .store
            .delete_sessions_started_before(now - self.max_session_age)
            .await?;
        let terminated_cutoff = now - chrono::Duration::hours(TERMINATED_RETENTION_HOURS);
        let deleted_instances = self
            .store
            .delete_terminated_instances_before(terminated_cutoff)
            .await?;
        Ok(ReapReport {
            reaped_instances,
            expired_sessions,
            deleted_instances,
        })
    }

    /// Runs a pass every interval until `shutdown` fires. The first pass
    /// happens immediately.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(interval_secs = self.interval.as_secs(), "reaper started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.run_once().await {
                    Ok(report) => {
                        if report != ReapReport::default() {
                            tracing::info!(
                                reaped = report.reaped_instances.len(),
                                expired_sessions = report.expired_sessions,
                                deleted_instances = report.deleted_instances,
                                "cleanup pass finished"
                            );
                        }
                    }
                    Err(err) => tracing::error!(error = %err, "cleanup pass failed"),
                }
            }
            tracing::info!("reaper stopped");
        })
    }
}
