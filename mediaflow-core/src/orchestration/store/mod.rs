//! Durable state behind the orchestrator: task snapshots, the per-task
//! progress event log, and quota entries.

mod memory;
#[cfg(feature = "database")]
mod sqlite;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mediaflow_model::{ProgressEvent, TaskId, TaskStatus};
use tracing::info;

use super::config::StorageConfig;
use super::quota::QuotaEntry;
use super::task::TaskRecord;
#[cfg(not(feature = "database"))]
use crate::error::OrchestratorError;
use crate::error::Result;

pub use memory::MemoryStore;
#[cfg(feature = "database")]
pub use sqlite::{MIGRATOR, SqliteStore};

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save_task(&self, record: &TaskRecord) -> Result<()>;

    async fn load_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>>;

    /// Every task that has not reached a terminal status.
    async fn load_active_tasks(&self) -> Result<Vec<TaskRecord>>;

    /// Tasks created at or after `since`, counted by status.
    async fn count_by_status(&self, since: DateTime<Utc>) -> Result<BTreeMap<TaskStatus, u64>>;

    /// Deletes terminal tasks last updated before `cutoff`, together with
    /// their events. Returns the purged ids.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<TaskId>>;
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends one event. A duplicate `(task_id, sequence_number)` is an error.
    async fn append_event(&self, event: &ProgressEvent) -> Result<()>;

    /// Events for `task_id` in sequence order, optionally only those after
    /// `after`.
    async fn load_events(&self, task_id: TaskId, after: Option<u64>) -> Result<Vec<ProgressEvent>>;
}

#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn save_quota(&self, entry: &QuotaEntry) -> Result<()>;

    async fn load_quotas(&self) -> Result<Vec<QuotaEntry>>;
}

/// Full storage surface the orchestrator depends on.
#[async_trait]
pub trait OrchestratorStore: TaskStore + EventLog + QuotaStore + fmt::Debug {
    /// Appends `event` and saves `record` as one unit: either both are
    /// durable afterwards or neither is.
    async fn commit_transition(&self, record: &TaskRecord, event: &ProgressEvent) -> Result<()>;

    async fn close(&self) {}
}

/// Storage dependencies opened at process start and closed at shutdown.
#[derive(Debug, Clone)]
pub struct Backend {
    store: Arc<dyn OrchestratorStore>,
    durable: bool,
}

impl Backend {
    /// Opens SQLite when a database URL is configured, memory otherwise.
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        match config.database_url.as_deref() {
            Some(url) => Self::open_database(url, config.max_connections).await,
            None => {
                info!(target: "mediaflow::store", "no database configured; state is kept in memory");
                Ok(Self::memory())
            }
        }
    }

    #[cfg(feature = "database")]
    async fn open_database(url: &str, max_connections: u32) -> Result<Self> {
        let store = SqliteStore::connect(url, max_connections).await?;
        Ok(Self {
            store: Arc::new(store),
            durable: true,
        })
    }

    #[cfg(not(feature = "database"))]
    async fn open_database(url: &str, _max_connections: u32) -> Result<Self> {
        Err(OrchestratorError::Internal(format!(
            "database URL {url} configured but mediaflow-core was built without the `database` feature"
        )))
    }

    pub fn memory() -> Self {
        Self::from_store(Arc::new(MemoryStore::new()), false)
    }

    pub fn from_store(store: Arc<dyn OrchestratorStore>, durable: bool) -> Self {
        Self { store, durable }
    }

    pub fn store(&self) -> Arc<dyn OrchestratorStore> {
        Arc::clone(&self.store)
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub async fn close(self) {
        self.store.close().await;
        info!(target: "mediaflow::store", "storage backend closed");
    }
}
