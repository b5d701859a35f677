//! Data model shared by the mediaflow orchestrator, its storage layer, and
//! the operator tooling.
#![allow(missing_docs)]

pub mod contracts;
pub mod error;
pub mod events;
pub mod ids;
pub mod pipeline;
pub mod status;

pub use contracts::{
    LiveUpdate, StatusReport, SubmitErrorCode, SubmitRequest, SubmitResponse,
    TaskSnapshot,
};
pub use error::{ModelError, Result as ModelResult};
pub use events::{Outputs, ProgressEvent, RetrySchedule};
pub use ids::{OwnerId, TaskId, TemplateId};
pub use pipeline::{PipelineTemplate, StageDefinition};
pub use status::{FailureReason, TaskStatus};
