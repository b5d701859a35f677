use thiserror::Error;

/// Errors produced by model parsing and validation routines.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("unknown task status: {0}")]
    UnknownStatus(String),

    #[error("unknown failure reason: {0}")]
    UnknownFailureReason(String),

    #[error("invalid task id: {0}")]
    InvalidTaskId(String),

    #[error("invalid pipeline {template}: {reason}")]
    InvalidPipeline { template: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ModelError>;
