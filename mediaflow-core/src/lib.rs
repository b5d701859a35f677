//! # mediaflow core
//!
//! Orchestration engine for multi-stage processing tasks submitted by many
//! owners. A task moves through the stages of a pipeline template; each stage
//! outcome is committed together with an ordered progress event, and live
//! observers receive those events through the [`orchestration::progress`] bus.
//!
//! ## Feature Flags
//!
//! - `database` (default): SQLite persistence through `sqlx`. Without it only
//!   the in-memory store is available.
//!
//! ## Architecture
//!
//! - [`orchestration::quota`]: per-owner admission ledger
//! - [`orchestration::retry`]: backoff and retry decisions
//! - [`orchestration::stage`]: stage bodies and the timed executor
//! - [`orchestration::orchestrator`]: the task state machine
//! - [`orchestration::progress`]: durable event log with replay-then-live fan-out
//! - [`orchestration::maintenance`]: periodic stall, quota, and retention sweeps
//! - [`orchestration::runtime`]: worker pool supervising all of the above
#![allow(missing_docs)]

pub mod error;
pub mod orchestration;

pub use error::{
    AdmissionError, ConsistencyError, OrchestratorError, Result, SubmitError,
};
pub use mediaflow_model as model;
