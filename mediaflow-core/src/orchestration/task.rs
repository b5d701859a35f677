use chrono::{DateTime, Utc};
use mediaflow_model::{
    FailureReason, Outputs, OwnerId, PipelineTemplate, ProgressEvent,
    RetrySchedule, StageDefinition, TaskId, TaskSnapshot, TaskStatus,
};
use serde::{Deserialize, Serialize};

/// Recorded result of one attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    RetryableFailure { reason: String },
    FatalFailure { reason: String },
}

/// One execution try of a stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub stage_name: String,
    pub stage_index: usize,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    /// Absent while the attempt is in flight.
    pub outcome: Option<AttemptOutcome>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Unit of work handed to the worker pool: run `attempt_number` of a stage.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StageWork {
    pub task_id: TaskId,
    pub stage_index: usize,
    pub stage_name: String,
    pub attempt_number: u32,
}

/// Authoritative state of a task, owned by the orchestrator.
///
/// The pipeline template is captured at submission so a task keeps running
/// against the stages it was admitted with, across restarts and config
/// changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub owner_id: OwnerId,
    pub pipeline: PipelineTemplate,
    pub payload_reference: String,
    pub status: TaskStatus,
    pub current_stage_index: usize,
    pub progress_percent: u8,
    pub completed_weight: u64,
    pub outputs: Outputs,
    pub error: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Sequence number the next progress event receives.
    pub next_sequence: u64,
    /// Whether the task still occupies a quota slot.
    pub quota_held: bool,
    pub cancel_requested: bool,
    pub attempts: Vec<Attempt>,
}

impl TaskRecord {
    pub fn new(
        task_id: TaskId,
        owner_id: OwnerId,
        pipeline: PipelineTemplate,
        payload_reference: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            owner_id,
            pipeline,
            payload_reference,
            status: TaskStatus::Queued,
            current_stage_index: 0,
            progress_percent: 0,
            completed_weight: 0,
            outputs: Outputs::new(),
            error: None,
            created_at: now,
            updated_at: now,
            last_activity_at: now,
            next_sequence: 0,
            quota_held: false,
            cancel_requested: false,
            attempts: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn current_stage(&self) -> Option<&StageDefinition> {
        self.pipeline.stage(self.current_stage_index)
    }

    pub fn is_last_stage(&self, stage_index: usize) -> bool {
        stage_index + 1 >= self.pipeline.len()
    }

    /// Sequence number of the last committed event.
    pub fn cursor(&self) -> Option<u64> {
        self.next_sequence.checked_sub(1)
    }

    pub fn latest_attempt(&self, stage_index: usize) -> Option<&Attempt> {
        self.attempts
            .iter()
            .filter(|a| a.stage_index == stage_index)
            .max_by_key(|a| a.attempt_number)
    }

    fn attempt_mut(&mut self, stage_index: usize, attempt_number: u32) -> Option<&mut Attempt> {
        self.attempts
            .iter_mut()
            .find(|a| a.stage_index == stage_index && a.attempt_number == attempt_number)
    }

    /// Whether the outcome of `(stage_index, attempt_number)` has already
    /// been applied, or superseded by later progress.
    pub fn has_applied(&self, stage_index: usize, attempt_number: u32) -> bool {
        if stage_index < self.current_stage_index {
            return true;
        }
        if stage_index > self.current_stage_index {
            return false;
        }
        match self.latest_attempt(stage_index) {
            Some(latest) if latest.attempt_number > attempt_number => true,
            Some(latest) if latest.attempt_number == attempt_number => latest.outcome.is_some(),
            _ => false,
        }
    }

    /// Records an in-flight attempt, reusing the entry when the same attempt
    /// is dispatched again after a restart.
    pub fn start_attempt(&mut self, work: &StageWork, now: DateTime<Utc>, history_limit: usize) {
        self.last_activity_at = now;
        if let Some(existing) = self.attempt_mut(work.stage_index, work.attempt_number) {
            existing.started_at = now;
            existing.outcome = None;
            existing.next_retry_at = None;
            return;
        }

        self.attempts.push(Attempt {
            stage_name: work.stage_name.clone(),
            stage_index: work.stage_index,
            attempt_number: work.attempt_number,
            started_at: now,
            outcome: None,
            next_retry_at: None,
        });
        self.prune_attempts(work.stage_index, history_limit);
    }

    /// Stores the outcome of an attempt, creating the entry if the start was
    /// never recorded.
    #[allow(clippy::too_many_arguments)]
    pub fn finish_attempt(
        &mut self,
        stage_index: usize,
        stage_name: &str,
        attempt_number: u32,
        outcome: AttemptOutcome,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        history_limit: usize,
    ) {
        self.last_activity_at = now;
        if let Some(existing) = self.attempt_mut(stage_index, attempt_number) {
            existing.outcome = Some(outcome);
            existing.next_retry_at = next_retry_at;
            return;
        }

        self.attempts.push(Attempt {
            stage_name: stage_name.to_string(),
            stage_index,
            attempt_number,
            started_at: now,
            outcome: Some(outcome),
            next_retry_at,
        });
        self.prune_attempts(stage_index, history_limit);
    }

    fn prune_attempts(&mut self, stage_index: usize, history_limit: usize) {
        let limit = history_limit.max(1);
        let mut numbers: Vec<u32> = self
            .attempts
            .iter()
            .filter(|a| a.stage_index == stage_index)
            .map(|a| a.attempt_number)
            .collect();
        if numbers.len() <= limit {
            return;
        }
        numbers.sort_unstable();
        let cutoff = numbers[numbers.len() - limit];
        self.attempts
            .retain(|a| a.stage_index != stage_index || a.attempt_number >= cutoff);
    }

    /// Builds the next progress event from the record's current state and
    /// advances the sequence counter.
    pub fn emit(
        &mut self,
        now: DateTime<Utc>,
        stage_index: Option<usize>,
        outputs_delta: Outputs,
        attempt: Option<u32>,
        retry: Option<RetrySchedule>,
    ) -> ProgressEvent {
        let sequence_number = self.next_sequence;
        self.next_sequence += 1;
        self.updated_at = now;

        ProgressEvent {
            task_id: self.task_id,
            sequence_number,
            status: self.status,
            progress_percent: self.progress_percent,
            stage_name: stage_index
                .and_then(|i| self.pipeline.stage(i))
                .map(|s| s.name.clone()),
            stage_index,
            outputs_delta,
            emitted_at: now,
            attempt,
            retry,
            error: self.error.clone(),
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let current_stage = match self.status {
            TaskStatus::Completed | TaskStatus::Rejected => None,
            _ => self.current_stage().map(|s| s.name.clone()),
        };

        TaskSnapshot {
            task_id: self.task_id,
            owner_id: self.owner_id.clone(),
            status: self.status,
            progress_percent: self.progress_percent,
            current_stage,
            outputs: self.outputs.clone(),
            error: self.error.clone(),
            cursor: self.cursor().unwrap_or_default(),
            updated_at: self.updated_at,
        }
    }
}
