//! Task orchestration: pipelines, admission, retries, progress delivery,
//! maintenance, and the worker runtime that ties them together.

pub mod config;
pub mod maintenance;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod quota;
pub mod retry;
pub mod runtime;
pub mod stage;
pub mod store;
pub mod task;

pub use config::*;
pub use maintenance::*;
pub use orchestrator::*;
pub use pipeline::*;
pub use progress::*;
pub use quota::*;
pub use retry::*;
pub use runtime::*;
pub use stage::*;
pub use store::*;
pub use task::*;
