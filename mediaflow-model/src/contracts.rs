//! Request/response shapes exchanged with callers outside the orchestrator.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::events::{Outputs, RetrySchedule};
use crate::ids::{OwnerId, TaskId, TemplateId};
use crate::status::{FailureReason, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SubmitRequest {
    pub owner_id: OwnerId,
    pub pipeline_template_id: TemplateId,
    pub payload_reference: String,
}

/// Machine-readable submission failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SubmitErrorCode {
    QuotaExceeded,
    UnknownTemplate,
    Internal,
}

impl SubmitErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            SubmitErrorCode::QuotaExceeded => "quota_exceeded",
            SubmitErrorCode::UnknownTemplate => "unknown_template",
            SubmitErrorCode::Internal => "internal",
        }
    }
}

/// `{task_id}` on success, `{error}` otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum SubmitResponse {
    Accepted { task_id: TaskId },
    Rejected { error: SubmitErrorCode },
}

/// Point-in-time view of a task, consistent with the latest applied event.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub owner_id: OwnerId,
    pub status: TaskStatus,
    pub progress_percent: u8,
    pub current_stage: Option<String>,
    pub outputs: Outputs,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none", default))]
    pub error: Option<FailureReason>,
    /// Sequence number of the last applied progress event.
    pub cursor: u64,
    pub updated_at: DateTime<Utc>,
}

/// Message pushed to live observers.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LiveUpdate {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress_percent: u8,
    pub stage: Option<String>,
    pub outputs_delta: Outputs,
    pub timestamp: DateTime<Utc>,
    pub cursor: u64,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none", default))]
    pub error: Option<FailureReason>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none", default))]
    pub retry: Option<RetrySchedule>,
}

/// Counts of tasks created inside a window, grouped by status.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatusReport {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub counts: BTreeMap<TaskStatus, u64>,
}

impl StatusReport {
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn count(&self, status: TaskStatus) -> u64 {
        self.counts.get(&status).copied().unwrap_or_default()
    }
}
