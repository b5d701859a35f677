use std::collections::HashMap;
use std::time::Duration;

use mediaflow_model::{OwnerId, PipelineTemplate};
use serde::{Deserialize, Serialize};

use super::pipeline::default_media_pipeline;

/// Global knobs that tune orchestrator behaviour.
///
/// All fields carry defaults so a deployment only has to spell out what it
/// wants to change.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Per-owner admission limits.
    pub quota: QuotaConfig,
    /// Retry/backoff policy shared by all stages.
    pub retry: RetryConfig,
    /// Live delivery tuning.
    pub progress: ProgressConfig,
    /// Stall detection, quota reconciliation, and retention.
    pub maintenance: MaintenanceConfig,
    /// Worker pool sizing.
    pub workers: WorkerConfig,
    /// Where durable state lives.
    pub storage: StorageConfig,
    /// Registered pipeline templates.
    pub pipelines: Vec<PipelineTemplate>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            quota: QuotaConfig::default(),
            retry: RetryConfig::default(),
            progress: ProgressConfig::default(),
            maintenance: MaintenanceConfig::default(),
            workers: WorkerConfig::default(),
            storage: StorageConfig::default(),
            pipelines: vec![default_media_pipeline()],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Active tasks an owner may hold when no override applies.
    pub default_limit: u32,
    /// Per-owner limits.
    pub overrides: HashMap<OwnerId, u32>,
    /// Entries untouched for this long are reconciled against live tasks.
    pub idle_retention_secs: u64,
}

impl QuotaConfig {
    pub fn idle_retention(&self) -> Duration {
        Duration::from_secs(self.idle_retention_secs)
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_limit: 3,
            overrides: HashMap::new(),
            idle_retention_secs: 60 * 60,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
    /// Seed for reproducible jitter. Unset means thread-local randomness.
    pub jitter_seed: Option<u64>,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1_000,
            backoff_max_ms: 60 * 1_000,
            jitter_ratio: 0.25,
            jitter_seed: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Live events buffered per subscriber before it is dropped as lagging.
    pub subscriber_buffer: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Sweep cadence (ms).
    pub interval_ms: u64,
    /// Running tasks without attempt activity for this long are failed as stalled.
    pub staleness_secs: u64,
    /// Terminal tasks older than this are purged along with their events.
    pub task_retention_secs: u64,
    /// Attempts kept per stage in a task's history.
    pub attempt_history_limit: usize,
    /// Default window for status reports.
    pub report_window_secs: u64,
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }

    pub fn report_window(&self) -> Duration {
        Duration::from_secs(self.report_window_secs)
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            staleness_secs: 15 * 60,
            task_retention_secs: 72 * 60 * 60,
            attempt_history_limit: 5,
            report_window_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Stage executions running at once.
    pub parallelism: usize,
    /// Capacity of the shared work queue.
    pub queue_capacity: usize,
    /// How long shutdown waits for in-flight stages (ms).
    pub shutdown_grace_ms: u64,
}

impl WorkerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            queue_capacity: 1_024,
            shutdown_grace_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite URL, e.g. `sqlite://mediaflow.db`. Unset keeps state in memory.
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_platform_settings() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.quota.default_limit, 3);
        assert_eq!(config.retry.backoff_max(), Duration::from_secs(60));
        assert_eq!(config.maintenance.task_retention(), Duration::from_secs(72 * 3600));
        assert_eq!(config.pipelines.len(), 1);
        assert_eq!(config.pipelines[0].id.as_str(), "media");
    }

    #[test]
    fn partial_documents_keep_remaining_defaults() {
        let config: OrchestratorConfig = serde_json::from_value(serde_json::json!({
            "quota": { "default_limit": 1 },
            "workers": { "parallelism": 8 }
        }))
        .unwrap();

        assert_eq!(config.quota.default_limit, 1);
        assert_eq!(config.quota.idle_retention_secs, 3600);
        assert_eq!(config.workers.parallelism, 8);
        assert_eq!(config.workers.shutdown_grace_ms, 30_000);
        assert_eq!(config.pipelines[0].id.as_str(), "media");
    }
}
