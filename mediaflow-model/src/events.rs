use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::contracts::LiveUpdate;
use crate::ids::TaskId;
use crate::status::{FailureReason, TaskStatus};

/// Named result references produced by stages (e.g. `thumbnail` ->
/// object-store key). Populated incrementally as stages succeed.
pub type Outputs = BTreeMap<String, String>;

/// Immutable record of one task state change.
///
/// `sequence_number` starts at 0 for every task and increases by exactly one
/// per event.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub sequence_number: u64,
    pub status: TaskStatus,
    pub progress_percent: u8,
    pub stage_name: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub stage_index: Option<usize>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub outputs_delta: Outputs,
    pub emitted_at: DateTime<Utc>,
    /// Attempt whose outcome produced this event, if any.
    #[cfg_attr(feature = "serde", serde(default))]
    pub attempt: Option<u32>,
    /// Present on informational events announcing a scheduled retry.
    #[cfg_attr(feature = "serde", serde(default))]
    pub retry: Option<RetrySchedule>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub error: Option<FailureReason>,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn to_live_update(&self) -> LiveUpdate {
        LiveUpdate {
            task_id: self.task_id,
            status: self.status,
            progress_percent: self.progress_percent,
            stage: self.stage_name.clone(),
            outputs_delta: self.outputs_delta.clone(),
            timestamp: self.emitted_at,
            cursor: self.sequence_number,
            error: self.error.clone(),
            retry: self.retry.clone(),
        }
    }
}

/// Retry announcement carried by an informational progress event.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetrySchedule {
    /// Attempt number that will run next.
    pub attempt_number: u32,
    pub next_retry_at: DateTime<Utc>,
    pub reason: String,
}
