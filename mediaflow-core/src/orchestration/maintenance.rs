use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use mediaflow_model::TaskId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::MaintenanceConfig;
use super::orchestrator::PipelineOrchestrator;
use super::quota::QuotaAdjustment;
use crate::error::Result;

/// What one maintenance pass changed.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub stalled: Vec<TaskId>,
    pub quota_adjusted: Vec<QuotaAdjustment>,
    pub purged: Vec<TaskId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.stalled.is_empty() && self.quota_adjusted.is_empty() && self.purged.is_empty()
    }
}

/// Periodic housekeeping: stall detection, idle quota reconciliation and
/// retention of finished tasks.
pub struct MaintenanceScheduler {
    orchestrator: Arc<PipelineOrchestrator>,
    config: MaintenanceConfig,
    idle_retention: TimeDelta,
}

impl fmt::Debug for MaintenanceScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaintenanceScheduler")
            .field("config", &self.config)
            .field("idle_retention", &self.idle_retention)
            .finish()
    }
}

fn span(duration: std::time::Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

fn cutoff(now: DateTime<Utc>, age: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl MaintenanceScheduler {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>) -> Self {
        let config = orchestrator.config().maintenance.clone();
        let idle_retention = span(orchestrator.config().quota.idle_retention());
        Self {
            orchestrator,
            config,
            idle_retention,
        }
    }

    /// Runs one sweep as of `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        let stall_cutoff = cutoff(now, span(self.config.staleness()));
        for task_id in self.orchestrator.live_task_ids() {
            match self.orchestrator.fail_if_stalled(task_id, stall_cutoff).await {
                Ok(true) => report.stalled.push(task_id),
                Ok(false) => {}
                Err(err) if err.is_conflict() => {
                    debug!(
                        target: "mediaflow::maintenance",
                        task_id = %task_id,
                        "task changed by another writer; reloading: {err}"
                    );
                    if let Err(err) = self.orchestrator.resync(task_id).await {
                        warn!(
                            target: "mediaflow::maintenance",
                            task_id = %task_id,
                            "failed to reload task: {err}"
                        );
                    }
                }
                Err(err) => warn!(
                    target: "mediaflow::maintenance",
                    task_id = %task_id,
                    "stall check failed: {err}"
                ),
            }
        }

        report.quota_adjusted = self
            .orchestrator
            .reconcile_idle_quotas(cutoff(now, self.idle_retention))
            .await;

        report.purged = self
            .orchestrator
            .purge_terminal(cutoff(now, span(self.config.task_retention())))
            .await?;

        if report.is_empty() {
            debug!(target: "mediaflow::maintenance", "sweep found nothing to do");
        } else {
            info!(
                target: "mediaflow::maintenance",
                stalled = report.stalled.len(),
                quota_adjusted = report.quota_adjusted.len(),
                purged = report.purged.len(),
                "maintenance sweep complete"
            );
        }
        Ok(report)
    }

    /// Runs [`run_once`](Self::run_once) every configured interval until
    /// `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let interval = self.config.interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!(target: "mediaflow::maintenance", "maintenance scheduler shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = self.run_once(Utc::now()).await {
                            warn!(target: "mediaflow::maintenance", "maintenance sweep failed: {err}");
                        }
                    }
                }
            }
        })
    }
}
