use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;

/// Lifecycle state of a task.
///
/// `Running` is paired with the task's `current_stage_index`; the index is
/// tracked on the record rather than inside the variant so the wire form
/// stays a plain string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Rejected,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Rejected,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Rejected
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// `Running -> Running` covers the advance to the next stage.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Queued => matches!(next, Running | Rejected | Failed),
            Running => matches!(next, Running | Completed | Failed),
            Completed | Failed | Rejected => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "rejected" => Ok(TaskStatus::Rejected),
            other => Err(ModelError::UnknownStatus(other.to_string())),
        }
    }
}

/// Reason attached to a `failed` task. Rendered as `stage_failed:<name>`,
/// `stalled`, or `cancelled`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(into = "String", try_from = "String"))]
pub enum FailureReason {
    StageFailed(String),
    Stalled,
    Cancelled,
}

impl FailureReason {
    pub fn stage_failed(stage: impl Into<String>) -> Self {
        FailureReason::StageFailed(stage.into())
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::StageFailed(stage) => write!(f, "stage_failed:{stage}"),
            FailureReason::Stalled => f.write_str("stalled"),
            FailureReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl FromStr for FailureReason {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stalled" => Ok(FailureReason::Stalled),
            "cancelled" => Ok(FailureReason::Cancelled),
            other => match other.strip_prefix("stage_failed:") {
                Some(stage) if !stage.is_empty() => {
                    Ok(FailureReason::StageFailed(stage.to_string()))
                }
                _ => Err(ModelError::UnknownFailureReason(other.to_string())),
            },
        }
    }
}

impl From<FailureReason> for String {
    fn from(reason: FailureReason) -> Self {
        reason.to_string()
    }
}

impl TryFrom<String> for FailureReason {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_admit_no_transitions() {
        for terminal in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Rejected] {
            assert!(terminal.is_terminal());
            for next in TaskStatus::ALL {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn queued_cannot_complete_without_running() {
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Rejected));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Rejected));
    }

    #[test]
    fn failure_reasons_use_the_fixed_vocabulary() {
        assert_eq!(
            FailureReason::stage_failed("convert").to_string(),
            "stage_failed:convert"
        );
        assert_eq!("stalled".parse::<FailureReason>(), Ok(FailureReason::Stalled));
        assert_eq!(
            "stage_failed:upload".parse::<FailureReason>(),
            Ok(FailureReason::StageFailed("upload".into()))
        );
        assert!("stage_failed:".parse::<FailureReason>().is_err());
        assert!("exploded".parse::<FailureReason>().is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn status_and_reason_serialize_as_plain_strings() {
        let status = serde_json::to_string(&TaskStatus::Running).unwrap();
        assert_eq!(status, "\"running\"");
        let reason = serde_json::to_string(&FailureReason::Cancelled).unwrap();
        assert_eq!(reason, "\"cancelled\"");
        let back: FailureReason = serde_json::from_str("\"stage_failed:convert\"").unwrap();
        assert_eq!(back, FailureReason::stage_failed("convert"));
    }
}
