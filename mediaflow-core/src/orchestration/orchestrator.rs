use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use mediaflow_model::{
    FailureReason, Outputs, OwnerId, ProgressEvent, RetrySchedule,
    StageDefinition, StatusReport, SubmitRequest, TaskId, TaskSnapshot,
    TaskStatus,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::config::OrchestratorConfig;
use super::pipeline::PipelineCatalog;
use super::progress::{ProgressBus, ProgressSubscription};
use super::quota::{QuotaAdjustment, QuotaLedger};
use super::retry::{RetryDecision, RetryPolicy};
use super::stage::{StageContext, StageOutcome};
use super::store::OrchestratorStore;
use super::task::{AttemptOutcome, StageWork, TaskRecord};
use crate::error::{
    AdmissionError, ConsistencyError, OrchestratorError, Result, SubmitError,
};

type TaskHandle = Arc<Mutex<TaskRecord>>;

/// A task accepted by [`PipelineOrchestrator::submit`] and its first stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub task_id: TaskId,
    pub work: StageWork,
}

/// Answer to [`PipelineOrchestrator::begin_attempt`].
#[derive(Debug, Clone)]
pub enum AttemptStart {
    /// Run the stage with this context.
    Proceed {
        stage: StageDefinition,
        context: StageContext,
    },
    /// The work item is stale, duplicate, or the task was cancelled.
    Abandoned,
}

/// Outcome of one stage attempt, reported back by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub task_id: TaskId,
    pub stage_index: usize,
    pub stage_name: String,
    pub attempt_number: u32,
    pub outcome: StageOutcome,
}

impl StageReport {
    pub fn new(work: &StageWork, outcome: StageOutcome) -> Self {
        Self {
            task_id: work.task_id,
            stage_index: work.stage_index,
            stage_name: work.stage_name.clone(),
            attempt_number: work.attempt_number,
            outcome,
        }
    }
}

/// What the runtime should do after [`PipelineOrchestrator::advance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Run the next stage.
    Dispatch(StageWork),
    /// Run this attempt after `delay`.
    Retry { work: StageWork, delay: Duration },
    /// The task reached a terminal status.
    Terminal(TaskStatus),
    /// The report was already applied or is stale.
    Ignored,
}

/// Work re-queued after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredWork {
    pub work: StageWork,
    pub delay: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub resumed: Vec<RecoveredWork>,
    pub quota_adjustments: Vec<QuotaAdjustment>,
}

/// Owns task state and drives every task through its pipeline.
///
/// Each live task sits behind its own lock; transitions of different tasks
/// never serialize on each other. Every transition is committed through the
/// progress bus together with the updated snapshot before the in-memory
/// record changes, so a failed write leaves the task exactly as it was.
pub struct PipelineOrchestrator {
    config: OrchestratorConfig,
    catalog: PipelineCatalog,
    store: Arc<dyn OrchestratorStore>,
    bus: Arc<ProgressBus>,
    quota: Arc<QuotaLedger>,
    retry: RetryPolicy,
    tasks: DashMap<TaskId, TaskHandle>,
    owners: DashMap<OwnerId, HashSet<TaskId>>,
}

impl fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("catalog", &self.catalog)
            .field("store", &self.store)
            .field("bus", &self.bus)
            .field("quota", &self.quota)
            .field("retry", &self.retry)
            .field("live_tasks", &self.tasks.len())
            .field("owners_with_live_tasks", &self.owners.len())
            .finish()
    }
}

impl PipelineOrchestrator {
    pub fn new(config: OrchestratorConfig, store: Arc<dyn OrchestratorStore>) -> Result<Self> {
        let retry = RetryPolicy::from_config(&config.retry);
        Self::with_retry_policy(config, store, retry)
    }

    pub fn with_retry_policy(
        config: OrchestratorConfig,
        store: Arc<dyn OrchestratorStore>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let catalog = PipelineCatalog::from_templates(config.pipelines.clone())?;
        let bus = Arc::new(ProgressBus::new(
            Arc::clone(&store),
            config.progress.subscriber_buffer,
        ));
        let quota = Arc::new(QuotaLedger::new(&config.quota));

        Ok(Self {
            config,
            catalog,
            store,
            bus,
            quota,
            retry,
            tasks: DashMap::new(),
            owners: DashMap::new(),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn catalog(&self) -> &PipelineCatalog {
        &self.catalog
    }

    pub fn bus(&self) -> Arc<ProgressBus> {
        Arc::clone(&self.bus)
    }

    pub fn quota(&self) -> Arc<QuotaLedger> {
        Arc::clone(&self.quota)
    }

    pub fn store(&self) -> Arc<dyn OrchestratorStore> {
        Arc::clone(&self.store)
    }

    fn history_limit(&self) -> usize {
        self.config.maintenance.attempt_history_limit
    }

    fn live_task(&self, task_id: TaskId) -> Option<TaskHandle> {
        self.tasks.get(&task_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn live_task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|entry| *entry.key()).collect()
    }

    /// Live tasks currently holding one of `owner_id`'s slots.
    pub fn live_count(&self, owner_id: &OwnerId) -> u32 {
        self.owners
            .get(owner_id)
            .map(|set| u32::try_from(set.len()).unwrap_or(u32::MAX))
            .unwrap_or_default()
    }

    fn track(&self, record: TaskRecord) {
        let task_id = record.task_id;
        if record.quota_held {
            self.owners
                .entry(record.owner_id.clone())
                .or_default()
                .insert(task_id);
        }
        self.tasks.insert(task_id, Arc::new(Mutex::new(record)));
    }

    fn untrack(&self, task_id: TaskId, owner_id: &OwnerId) {
        self.tasks.remove(&task_id);
        if let Some(mut set) = self.owners.get_mut(owner_id) {
            set.remove(&task_id);
        }
        self.owners.remove_if(owner_id, |_, set| set.is_empty());
    }

    async fn persist_quota(&self, owner_id: &OwnerId) {
        let Some(entry) = self.quota.entry(owner_id) else {
            return;
        };
        if let Err(err) = self.store.save_quota(&entry).await {
            warn!(
                target: "mediaflow::quota",
                owner_id = %owner_id,
                "failed to persist quota entry: {err}"
            );
        }
    }

    async fn release_quota(&self, owner_id: &OwnerId) {
        // `QuotaLedger::release` warns about the violation; the entry is
        // unchanged, so there is nothing to persist.
        if let Err(err) = self.quota.release(owner_id) {
            debug!(target: "mediaflow::quota", owner_id = %owner_id, "quota release skipped: {err}");
            return;
        }
        self.persist_quota(owner_id).await;
    }

    /// Commits `next` with `event`, then swaps it into `record`. Releases the
    /// quota slot when `next` gave it up and stops tracking terminal tasks.
    async fn commit(&self, record: &mut TaskRecord, next: TaskRecord, event: ProgressEvent) -> Result<()> {
        if !record.status.can_transition_to(next.status) && record.status != next.status {
            let err = ConsistencyError::AlreadyTerminal {
                task_id: record.task_id,
                status: record.status,
            };
            warn!(target: "mediaflow::orchestrator", task_id = %record.task_id, "{err}");
            return Err(err.into());
        }

        self.bus.publish_transition(event, &next).await?;

        let released = record.quota_held && !next.quota_held;
        *record = next;
        if released {
            self.release_quota(&record.owner_id).await;
        }
        if record.is_terminal() {
            self.untrack(record.task_id, &record.owner_id);
        }
        Ok(())
    }

    /// Creates a task and tries to admit it under its owner's quota.
    ///
    /// A denied task is recorded as `rejected` with a single terminal event;
    /// no stage runs and no slot is charged.
    pub async fn submit(&self, request: SubmitRequest) -> std::result::Result<Submitted, SubmitError> {
        let template = self
            .catalog
            .get(&request.pipeline_template_id)
            .ok_or_else(|| OrchestratorError::UnknownTemplate(request.pipeline_template_id.clone()))?;
        let first_stage = template
            .stage(0)
            .map(|s| s.name.clone())
            .ok_or_else(|| OrchestratorError::Internal(format!("template {} has no stages", template.id)))?;

        let now = Utc::now();
        let task_id = TaskId::new();
        let owner_id = request.owner_id;
        let mut record = TaskRecord::new(
            task_id,
            owner_id.clone(),
            (*template).clone(),
            request.payload_reference,
            now,
        );

        if !self.quota.admit(&owner_id) {
            record.status = TaskStatus::Rejected;
            let event = record.emit(now, None, Outputs::new(), None, None);
            self.bus.publish_transition(event, &record).await?;
            self.persist_quota(&owner_id).await;

            let limit = self.quota.limit_for(&owner_id);
            info!(
                target: "mediaflow::orchestrator",
                task_id = %task_id,
                owner_id = %owner_id,
                limit,
                "task rejected: quota exceeded"
            );
            return Err(AdmissionError::QuotaExceeded {
                owner_id,
                limit,
                task_id,
            }
            .into());
        }

        record.quota_held = true;
        let event = record.emit(now, Some(0), Outputs::new(), None, None);
        if let Err(err) = self.bus.publish_transition(event, &record).await {
            self.release_quota(&owner_id).await;
            return Err(err.into());
        }
        self.persist_quota(&owner_id).await;
        self.track(record);

        info!(
            target: "mediaflow::orchestrator",
            task_id = %task_id,
            owner_id = %owner_id,
            template = %template.id,
            "task queued"
        );

        Ok(Submitted {
            task_id,
            work: StageWork {
                task_id,
                stage_index: 0,
                stage_name: first_stage,
                attempt_number: 1,
            },
        })
    }

    /// Records the start of an attempt. The first attempt moves the task
    /// from `queued` to `running`; a pending cancellation fails it instead.
    pub async fn begin_attempt(&self, work: &StageWork) -> Result<AttemptStart> {
        let Some(handle) = self.live_task(work.task_id) else {
            debug!(target: "mediaflow::orchestrator", task_id = %work.task_id, "work for finished task dropped");
            return Ok(AttemptStart::Abandoned);
        };
        let mut record = handle.lock().await;

        if record.is_terminal()
            || record.current_stage_index != work.stage_index
            || record.has_applied(work.stage_index, work.attempt_number)
        {
            debug!(
                target: "mediaflow::orchestrator",
                task_id = %work.task_id,
                stage = %work.stage_name,
                attempt = work.attempt_number,
                "stale work item dropped"
            );
            return Ok(AttemptStart::Abandoned);
        }

        let Some(stage) = record
            .pipeline
            .stage(work.stage_index)
            .filter(|s| s.name == work.stage_name)
            .cloned()
        else {
            warn!(
                target: "mediaflow::orchestrator",
                task_id = %work.task_id,
                stage = %work.stage_name,
                "work item does not match the task pipeline"
            );
            return Ok(AttemptStart::Abandoned);
        };

        let now = Utc::now();
        if record.cancel_requested {
            let next = record.clone();
            self.fail(&mut record, next, FailureReason::Cancelled, Some(work.stage_index), None, now)
                .await?;
            return Ok(AttemptStart::Abandoned);
        }

        let mut next = record.clone();
        next.start_attempt(work, now, self.history_limit());
        if next.status == TaskStatus::Queued {
            next.status = TaskStatus::Running;
            let event = next.emit(
                now,
                Some(work.stage_index),
                Outputs::new(),
                Some(work.attempt_number),
                None,
            );
            self.commit(&mut record, next, event).await?;
        } else {
            self.store.save_task(&next).await?;
            *record = next;
        }

        debug!(
            target: "mediaflow::orchestrator",
            task_id = %work.task_id,
            stage = %stage.name,
            attempt = work.attempt_number,
            "attempt started"
        );

        let context = StageContext {
            task_id: record.task_id,
            owner_id: record.owner_id.clone(),
            template_id: record.pipeline.id.clone(),
            stage_index: work.stage_index,
            stage_name: stage.name.clone(),
            attempt_number: work.attempt_number,
            payload_reference: record.payload_reference.clone(),
            outputs: record.outputs.clone(),
        };
        Ok(AttemptStart::Proceed { stage, context })
    }

    /// Applies a stage outcome. Re-applying an already processed
    /// `(task, stage, attempt)` is a no-op that returns `Ignored`.
    pub async fn advance(&self, report: StageReport) -> Result<AdvanceOutcome> {
        let Some(handle) = self.live_task(report.task_id) else {
            debug!(target: "mediaflow::orchestrator", task_id = %report.task_id, "report for finished task ignored");
            return Ok(AdvanceOutcome::Ignored);
        };
        let mut record = handle.lock().await;

        let index = report.stage_index;
        let attempt = report.attempt_number;
        if record.is_terminal()
            || record.current_stage_index != index
            || record.has_applied(index, attempt)
        {
            debug!(
                target: "mediaflow::orchestrator",
                task_id = %report.task_id,
                stage = %report.stage_name,
                attempt,
                "duplicate or stale report ignored"
            );
            return Ok(AdvanceOutcome::Ignored);
        }

        let Some(stage) = record
            .pipeline
            .stage(index)
            .filter(|s| s.name == report.stage_name)
            .cloned()
        else {
            warn!(
                target: "mediaflow::orchestrator",
                task_id = %report.task_id,
                stage = %report.stage_name,
                "report does not match the task pipeline"
            );
            return Ok(AdvanceOutcome::Ignored);
        };

        let now = Utc::now();
        let history = self.history_limit();
        let mut next = record.clone();

        if next.cancel_requested {
            next.finish_attempt(index, &stage.name, attempt, attempt_outcome(&report.outcome), None, now, history);
            return self
                .fail(&mut record, next, FailureReason::Cancelled, Some(index), Some(attempt), now)
                .await;
        }

        match report.outcome {
            StageOutcome::Success(outputs) => {
                next.finish_attempt(index, &stage.name, attempt, AttemptOutcome::Success, None, now, history);
                next.outputs.extend(outputs.clone());
                next.completed_weight = next.pipeline.weight_through(index + 1);
                let total = next.pipeline.total_weight().max(1);
                let percent = u8::try_from((next.completed_weight * 100 / total).min(100)).unwrap_or(100);
                next.progress_percent = next.progress_percent.max(percent);
                next.current_stage_index = index + 1;

                let following = if next.is_last_stage(index) {
                    None
                } else {
                    next.current_stage().map(|s| s.name.clone())
                };
                match following {
                    Some(next_stage) => {
                        let event = next.emit(now, Some(index), outputs, Some(attempt), None);
                        self.commit(&mut record, next, event).await?;
                        debug!(
                            target: "mediaflow::orchestrator",
                            task_id = %report.task_id,
                            stage = %stage.name,
                            progress = record.progress_percent,
                            "stage completed"
                        );
                        Ok(AdvanceOutcome::Dispatch(StageWork {
                            task_id: report.task_id,
                            stage_index: index + 1,
                            stage_name: next_stage,
                            attempt_number: 1,
                        }))
                    }
                    None => {
                        next.status = TaskStatus::Completed;
                        next.progress_percent = 100;
                        next.quota_held = false;
                        let event = next.emit(now, Some(index), outputs, Some(attempt), None);
                        self.commit(&mut record, next, event).await?;
                        info!(
                            target: "mediaflow::orchestrator",
                            task_id = %report.task_id,
                            owner_id = %record.owner_id,
                            "task completed"
                        );
                        Ok(AdvanceOutcome::Terminal(TaskStatus::Completed))
                    }
                }
            }
            StageOutcome::RetryableFailure(reason) => match self.retry.decide(attempt, stage.max_attempts) {
                RetryDecision::Retry { next_attempt, delay } => {
                    let next_retry_at = now + TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero());
                    next.finish_attempt(
                        index,
                        &stage.name,
                        attempt,
                        AttemptOutcome::RetryableFailure { reason: reason.clone() },
                        Some(next_retry_at),
                        now,
                        history,
                    );
                    let schedule = RetrySchedule {
                        attempt_number: next_attempt,
                        next_retry_at,
                        reason: reason.clone(),
                    };
                    let event = next.emit(now, Some(index), Outputs::new(), Some(attempt), Some(schedule));
                    self.commit(&mut record, next, event).await?;
                    info!(
                        target: "mediaflow::orchestrator",
                        task_id = %report.task_id,
                        stage = %stage.name,
                        attempt,
                        next_attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "stage failed, retry scheduled: {reason}"
                    );
                    Ok(AdvanceOutcome::Retry {
                        work: StageWork {
                            task_id: report.task_id,
                            stage_index: index,
                            stage_name: stage.name.clone(),
                            attempt_number: next_attempt,
                        },
                        delay,
                    })
                }
                RetryDecision::Exhausted => {
                    next.finish_attempt(
                        index,
                        &stage.name,
                        attempt,
                        AttemptOutcome::RetryableFailure { reason: reason.clone() },
                        None,
                        now,
                        history,
                    );
                    warn!(
                        target: "mediaflow::orchestrator",
                        task_id = %report.task_id,
                        stage = %stage.name,
                        attempt,
                        "retry budget exhausted: {reason}"
                    );
                    self.fail(
                        &mut record,
                        next,
                        FailureReason::stage_failed(&stage.name),
                        Some(index),
                        Some(attempt),
                        now,
                    )
                    .await
                }
            },
            StageOutcome::FatalFailure(reason) => {
                next.finish_attempt(
                    index,
                    &stage.name,
                    attempt,
                    AttemptOutcome::FatalFailure { reason: reason.clone() },
                    None,
                    now,
                    history,
                );
                warn!(
                    target: "mediaflow::orchestrator",
                    task_id = %report.task_id,
                    stage = %stage.name,
                    attempt,
                    "stage failed permanently: {reason}"
                );
                self.fail(
                    &mut record,
                    next,
                    FailureReason::stage_failed(&stage.name),
                    Some(index),
                    Some(attempt),
                    now,
                )
                .await
            }
        }
    }

    async fn fail(
        &self,
        record: &mut TaskRecord,
        mut next: TaskRecord,
        reason: FailureReason,
        stage_index: Option<usize>,
        attempt: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<AdvanceOutcome> {
        next.status = TaskStatus::Failed;
        next.error = Some(reason.clone());
        next.quota_held = false;
        let event = next.emit(now, stage_index, Outputs::new(), attempt, None);
        self.commit(record, next, event).await?;
        info!(
            target: "mediaflow::orchestrator",
            task_id = %record.task_id,
            owner_id = %record.owner_id,
            error = %reason,
            "task failed"
        );
        Ok(AdvanceOutcome::Terminal(TaskStatus::Failed))
    }

    /// Requests cancellation. Takes effect at the task's next attempt
    /// boundary; returns `false` when the task is not live.
    pub async fn cancel(&self, task_id: TaskId) -> Result<bool> {
        let Some(handle) = self.live_task(task_id) else {
            return Ok(false);
        };
        let mut record = handle.lock().await;
        if record.is_terminal() {
            return Ok(false);
        }
        if !record.cancel_requested {
            let mut next = record.clone();
            next.cancel_requested = true;
            self.store.save_task(&next).await?;
            *record = next;
            info!(target: "mediaflow::orchestrator", task_id = %task_id, "cancellation requested");
        }
        Ok(true)
    }

    /// Fails a live task immediately. Returns `false` if it already finished.
    pub async fn force_fail(&self, task_id: TaskId, reason: FailureReason) -> Result<bool> {
        let Some(handle) = self.live_task(task_id) else {
            return Ok(false);
        };
        let mut record = handle.lock().await;
        if record.is_terminal() {
            return Ok(false);
        }
        self.force_fail_locked(&mut record, reason).await?;
        Ok(true)
    }

    /// Fails a running task as `stalled` if its last attempt activity is
    /// older than `cutoff`. Checked under the task lock so a task that just
    /// made progress is left alone.
    pub async fn fail_if_stalled(&self, task_id: TaskId, cutoff: DateTime<Utc>) -> Result<bool> {
        let Some(handle) = self.live_task(task_id) else {
            return Ok(false);
        };
        let mut record = handle.lock().await;
        if record.status != TaskStatus::Running || record.last_activity_at >= cutoff {
            return Ok(false);
        }
        self.force_fail_locked(&mut record, FailureReason::Stalled).await?;
        Ok(true)
    }

    async fn force_fail_locked(&self, record: &mut TaskRecord, reason: FailureReason) -> Result<()> {
        let now = Utc::now();
        let stage_index = record.current_stage().map(|_| record.current_stage_index);
        let last_activity_at = record.last_activity_at;
        let next = record.clone();
        self.fail(record, next, reason.clone(), stage_index, None, now).await?;
        info!(
            target: "mediaflow::orchestrator",
            task_id = %record.task_id,
            error = %reason,
            last_activity_at = %last_activity_at,
            "forced task failure"
        );
        Ok(())
    }

    /// Re-reads a task that another writer changed underneath this process,
    /// e.g. a standalone sweep that failed it as stalled.
    ///
    /// A task that is terminal in the store is dropped here and its local
    /// slot freed. Otherwise the stored record replaces the cached one and
    /// the work needed to continue it is returned.
    pub async fn resync(&self, task_id: TaskId) -> Result<Option<RecoveredWork>> {
        let Some(handle) = self.live_task(task_id) else {
            return Ok(None);
        };
        let mut record = handle.lock().await;
        self.bus.reload(task_id).await?;

        match self.store.load_task(task_id).await? {
            Some(mut stored) if !stored.is_terminal() => {
                stored.quota_held = record.quota_held;
                *record = stored;
                warn!(
                    target: "mediaflow::orchestrator",
                    task_id = %task_id,
                    stage_index = record.current_stage_index,
                    "task changed by another writer; continuing from the stored state"
                );
                Ok(resume_point(&record, Utc::now()))
            }
            stored => {
                let held = record.quota_held;
                if let Some(stored) = stored {
                    *record = stored;
                }
                record.quota_held = false;
                if held {
                    self.release_quota(&record.owner_id).await;
                }
                self.untrack(task_id, &record.owner_id);
                info!(
                    target: "mediaflow::orchestrator",
                    task_id = %task_id,
                    status = %record.status,
                    "task finished by another writer; dropped"
                );
                Ok(None)
            }
        }
    }

    pub async fn snapshot(&self, task_id: TaskId) -> Result<TaskSnapshot> {
        if let Some(handle) = self.live_task(task_id) {
            return Ok(handle.lock().await.snapshot());
        }
        self.store
            .load_task(task_id)
            .await?
            .map(|record| record.snapshot())
            .ok_or(OrchestratorError::TaskNotFound(task_id))
    }

    pub async fn subscribe(&self, task_id: TaskId) -> Result<ProgressSubscription> {
        self.bus.subscribe(task_id).await
    }

    pub async fn subscribe_after(&self, task_id: TaskId, cursor: u64) -> Result<ProgressSubscription> {
        self.bus.subscribe_after(task_id, cursor).await
    }

    pub async fn events(&self, task_id: TaskId, after: Option<u64>) -> Result<Vec<ProgressEvent>> {
        self.bus.events(task_id, after).await
    }

    /// Counts tasks created within the trailing `window`, by status.
    pub async fn status_report(&self, window: Duration) -> Result<StatusReport> {
        let window_end = Utc::now();
        let window_start = TimeDelta::from_std(window)
            .ok()
            .and_then(|span| window_end.checked_sub_signed(span))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let counts = self.store.count_by_status(window_start).await?;
        Ok(StatusReport {
            window_start,
            window_end,
            counts,
        })
    }

    /// Reconciles quota entries untouched since `cutoff` with the live tasks
    /// actually holding slots.
    pub async fn reconcile_idle_quotas(&self, cutoff: DateTime<Utc>) -> Vec<QuotaAdjustment> {
        let mut adjustments = Vec::new();
        for owner_id in self.quota.idle_owners(cutoff) {
            let live = self.live_count(&owner_id);
            if let Some(adjustment) = self.quota.reconcile(&owner_id, live, cutoff) {
                info!(
                    target: "mediaflow::quota",
                    owner_id = %owner_id,
                    previous = adjustment.previous,
                    current = adjustment.current,
                    "quota entry reconciled"
                );
                self.persist_quota(&owner_id).await;
                adjustments.push(adjustment);
            }
        }
        adjustments
    }

    /// Deletes terminal tasks last updated before `cutoff`.
    pub async fn purge_terminal(&self, cutoff: DateTime<Utc>) -> Result<Vec<TaskId>> {
        let purged = self.store.purge_terminal_before(cutoff).await?;
        self.bus.evict(&purged);
        Ok(purged)
    }

    /// Reloads non-terminal tasks and quota entries after a restart and
    /// returns the work needed to resume them.
    ///
    /// An attempt with no recorded outcome is dispatched again under the same
    /// attempt number; a pending retry keeps its original schedule.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let now = Utc::now();
        self.quota.restore(self.store.load_quotas().await?);

        let mut resumed = Vec::new();
        let mut owners: HashSet<OwnerId> = HashSet::new();
        for mut record in self.store.load_active_tasks().await? {
            if self.tasks.contains_key(&record.task_id) {
                continue;
            }
            record.quota_held = true;
            owners.insert(record.owner_id.clone());
            match resume_point(&record, now) {
                Some(work) => resumed.push(work),
                None => warn!(
                    target: "mediaflow::orchestrator",
                    task_id = %record.task_id,
                    stage_index = record.current_stage_index,
                    "recovered task has no runnable stage"
                ),
            }
            self.track(record);
        }

        owners.extend(self.quota.entries().into_iter().map(|entry| entry.owner_id));
        let mut quota_adjustments = Vec::new();
        for owner_id in owners {
            let live = self.live_count(&owner_id);
            if let Some(adjustment) = self.quota.reset(&owner_id, live) {
                self.persist_quota(&owner_id).await;
                quota_adjustments.push(adjustment);
            }
        }

        info!(
            target: "mediaflow::orchestrator",
            resumed = resumed.len(),
            quota_adjustments = quota_adjustments.len(),
            "recovery complete"
        );

        Ok(RecoveryReport {
            resumed,
            quota_adjustments,
        })
    }
}

fn attempt_outcome(outcome: &StageOutcome) -> AttemptOutcome {
    match outcome {
        StageOutcome::Success(_) => AttemptOutcome::Success,
        StageOutcome::RetryableFailure(reason) => AttemptOutcome::RetryableFailure {
            reason: reason.clone(),
        },
        StageOutcome::FatalFailure(reason) => AttemptOutcome::FatalFailure {
            reason: reason.clone(),
        },
    }
}

fn resume_point(record: &TaskRecord, now: DateTime<Utc>) -> Option<RecoveredWork> {
    let stage = record.current_stage()?;
    let index = record.current_stage_index;

    let (attempt_number, delay) = match record.latest_attempt(index) {
        None => (1, Duration::ZERO),
        Some(latest) => match (&latest.outcome, latest.next_retry_at) {
            (None, _) => {
                warn!(
                    target: "mediaflow::orchestrator",
                    task_id = %record.task_id,
                    stage = %stage.name,
                    attempt = latest.attempt_number,
                    "attempt outcome unknown after restart; dispatching again"
                );
                (latest.attempt_number, Duration::ZERO)
            }
            (Some(_), Some(retry_at)) => (
                latest.attempt_number + 1,
                (retry_at - now).to_std().unwrap_or_default(),
            ),
            (Some(_), None) => (latest.attempt_number + 1, Duration::ZERO),
        },
    };

    Some(RecoveredWork {
        work: StageWork {
            task_id: record.task_id,
            stage_index: index,
            stage_name: stage.name.clone(),
            attempt_number,
        },
        delay,
    })
}
