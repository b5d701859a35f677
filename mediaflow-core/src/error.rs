use mediaflow_model::{
    ModelError, OwnerId, SubmitErrorCode, SubmitResponse, TaskId, TaskStatus,
    TemplateId,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Unknown pipeline template: {0}")]
    UnknownTemplate(TemplateId),

    #[error("Invalid model data: {0}")]
    Model(#[from] ModelError),

    #[error("Consistency violation: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "database")]
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Another writer changed the stored task first; the cached record is
    /// stale.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Consistency(
                ConsistencyError::AlreadyTerminal { .. } | ConsistencyError::SequenceTaken { .. }
            )
        )
    }
}

/// Violations of ordering or accounting invariants. These are logged and
/// neutralized at the point of detection; callers see them only as errors
/// on the offending operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("out-of-order event for task {task_id}: expected sequence {expected}, got {got}")]
    OutOfOrder {
        task_id: TaskId,
        expected: u64,
        got: u64,
    },

    #[error("quota for owner {0} released with no active tasks")]
    DoubleRelease(OwnerId),

    #[error("task {task_id} is already terminal ({status})")]
    AlreadyTerminal { task_id: TaskId, status: TaskStatus },

    #[error("event {sequence} for task {task_id} is already recorded")]
    SequenceTaken { task_id: TaskId, sequence: u64 },
}

/// Policy rejection reported synchronously to the submitter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("owner {owner_id} already has {limit} active tasks")]
    QuotaExceeded {
        owner_id: OwnerId,
        limit: u32,
        /// The task that was recorded as `rejected`.
        task_id: TaskId,
    },
}

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl SubmitError {
    pub fn code(&self) -> SubmitErrorCode {
        match self {
            SubmitError::Admission(AdmissionError::QuotaExceeded { .. }) => {
                SubmitErrorCode::QuotaExceeded
            }
            SubmitError::Orchestrator(OrchestratorError::UnknownTemplate(_)) => {
                SubmitErrorCode::UnknownTemplate
            }
            SubmitError::Orchestrator(_) => SubmitErrorCode::Internal,
        }
    }

    pub fn into_response(self) -> SubmitResponse {
        SubmitResponse::Rejected { error: self.code() }
    }
}
