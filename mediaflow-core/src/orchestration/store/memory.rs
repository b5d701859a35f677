use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mediaflow_model::{OwnerId, ProgressEvent, TaskId, TaskStatus};

use super::{EventLog, OrchestratorStore, QuotaStore, TaskStore};
use crate::error::{ConsistencyError, OrchestratorError, Result};
use crate::orchestration::quota::QuotaEntry;
use crate::orchestration::task::TaskRecord;

/// Process-local store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    tasks: DashMap<TaskId, TaskRecord>,
    events: DashMap<TaskId, Vec<ProgressEvent>>,
    quotas: DashMap<OwnerId, QuotaEntry>,
    read_only: AtomicBool,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("tasks", &self.tasks.len())
            .field("event_logs", &self.events.len())
            .field("quotas", &self.quotas.len())
            .field("read_only", &self.read_only.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write fail until switched back; simulates an unavailable
    /// backend.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Storage("store is read-only".into()));
        }
        Ok(())
    }

    fn push_event(&self, event: &ProgressEvent) -> Result<()> {
        let mut log = self.events.entry(event.task_id).or_default();
        if log
            .iter()
            .any(|existing| existing.sequence_number == event.sequence_number)
        {
            return Err(ConsistencyError::SequenceTaken {
                task_id: event.task_id,
                sequence: event.sequence_number,
            }
            .into());
        }
        log.push(event.clone());
        log.sort_by_key(|e| e.sequence_number);
        Ok(())
    }

    /// Terminal records are never overwritten.
    fn ensure_replaceable(&self, task_id: TaskId) -> Result<()> {
        match self.tasks.get(&task_id) {
            Some(stored) if stored.is_terminal() => Err(ConsistencyError::AlreadyTerminal {
                task_id,
                status: stored.status,
            }
            .into()),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn save_task(&self, record: &TaskRecord) -> Result<()> {
        self.ensure_writable()?;
        self.ensure_replaceable(record.task_id)?;
        self.tasks.insert(record.task_id, record.clone());
        Ok(())
    }

    async fn load_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>> {
        Ok(self.tasks.get(&task_id).map(|r| r.value().clone()))
    }

    async fn load_active_tasks(&self) -> Result<Vec<TaskRecord>> {
        let mut active: Vec<TaskRecord> = self
            .tasks
            .iter()
            .filter(|r| !r.is_terminal())
            .map(|r| r.value().clone())
            .collect();
        active.sort_by_key(|r| r.created_at);
        Ok(active)
    }

    async fn count_by_status(&self, since: DateTime<Utc>) -> Result<BTreeMap<TaskStatus, u64>> {
        let mut counts = BTreeMap::new();
        for record in self.tasks.iter().filter(|r| r.created_at >= since) {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<TaskId>> {
        self.ensure_writable()?;
        let expired: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|r| r.is_terminal() && r.updated_at < cutoff)
            .map(|r| r.task_id)
            .collect();
        for task_id in &expired {
            self.tasks.remove(task_id);
            self.events.remove(task_id);
        }
        Ok(expired)
    }
}

#[async_trait]
impl EventLog for MemoryStore {
    async fn append_event(&self, event: &ProgressEvent) -> Result<()> {
        self.ensure_writable()?;
        self.push_event(event)
    }

    async fn load_events(&self, task_id: TaskId, after: Option<u64>) -> Result<Vec<ProgressEvent>> {
        Ok(self
            .events
            .get(&task_id)
            .map(|log| {
                log.iter()
                    .filter(|e| after.is_none_or(|cursor| e.sequence_number > cursor))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn save_quota(&self, entry: &QuotaEntry) -> Result<()> {
        self.ensure_writable()?;
        self.quotas.insert(entry.owner_id.clone(), entry.clone());
        Ok(())
    }

    async fn load_quotas(&self) -> Result<Vec<QuotaEntry>> {
        Ok(self.quotas.iter().map(|q| q.value().clone()).collect())
    }
}

#[async_trait]
impl OrchestratorStore for MemoryStore {
    async fn commit_transition(&self, record: &TaskRecord, event: &ProgressEvent) -> Result<()> {
        self.ensure_writable()?;
        self.ensure_replaceable(record.task_id)?;
        self.push_event(event)?;
        self.tasks.insert(record.task_id, record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mediaflow_model::{PipelineTemplate, StageDefinition};

    use super::*;

    fn record() -> TaskRecord {
        let pipeline = PipelineTemplate::new(
            "t",
            vec![StageDefinition::new("a", 1, 1, Duration::from_secs(1))],
        );
        TaskRecord::new(TaskId::new(), OwnerId::new("alice"), pipeline, "p".into(), Utc::now())
    }

    #[tokio::test]
    async fn terminal_records_are_not_overwritten() {
        let store = MemoryStore::new();
        let mut running = record();
        running.status = TaskStatus::Running;
        store.save_task(&running).await.unwrap();

        let mut failed = running.clone();
        failed.status = TaskStatus::Failed;
        let event = failed.emit(Utc::now(), Some(0), Default::default(), None, None);
        store.commit_transition(&failed, &event).await.unwrap();

        let err = store.save_task(&running).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Consistency(ConsistencyError::AlreadyTerminal {
                status: TaskStatus::Failed,
                ..
            })
        ));
        let stored = store.load_task(running.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn duplicate_sequence_is_a_conflict() {
        let store = MemoryStore::new();
        let mut task = record();
        let event = task.emit(Utc::now(), Some(0), Default::default(), None, None);
        store.commit_transition(&task, &event).await.unwrap();

        let err = store.append_event(&event).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.load_events(task.task_id, None).await.unwrap().len(), 1);
    }
}
