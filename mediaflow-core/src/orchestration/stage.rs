use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use mediaflow_model::{OwnerId, Outputs, StageDefinition, TaskId, TemplateId};
use thiserror::Error;
use tracing::{debug, warn};

/// Everything a stage body needs to know about the attempt it runs.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub task_id: TaskId,
    pub owner_id: OwnerId,
    pub template_id: TemplateId,
    pub stage_index: usize,
    pub stage_name: String,
    pub attempt_number: u32,
    pub payload_reference: String,
    /// Outputs committed by earlier stages.
    pub outputs: Outputs,
}

/// Failure reported by a stage body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// Transient; the orchestrator may schedule another attempt.
    #[error("retryable stage error: {0}")]
    Retryable(String),
    /// Permanent; the task fails without further attempts.
    #[error("fatal stage error: {0}")]
    Fatal(String),
}

/// An opaque unit of work registered under a stage name.
///
/// Bodies run at least once per successful stage, so they should be
/// idempotent with respect to their outputs.
#[async_trait]
pub trait StageBody: Send + Sync {
    async fn execute(&self, context: StageContext) -> Result<Outputs, StageError>;
}

/// Adapts an async closure into a [`StageBody`].
pub struct FnStage<F> {
    func: F,
}

impl<F> FnStage<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> fmt::Debug for FnStage<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStage")
            .field("func", &type_name::<F>())
            .finish()
    }
}

#[async_trait]
impl<F, Fut> StageBody for FnStage<F>
where
    F: Fn(StageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outputs, StageError>> + Send + 'static,
{
    async fn execute(&self, context: StageContext) -> Result<Outputs, StageError> {
        (self.func)(context).await
    }
}

/// Stage bodies keyed by stage name.
#[derive(Clone, Default)]
pub struct StageRegistry {
    bodies: HashMap<String, Arc<dyn StageBody>>,
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.bodies.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("StageRegistry")
            .field("stages", &names)
            .finish()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, body: Arc<dyn StageBody>) -> &mut Self {
        self.bodies.insert(name.into(), body);
        self
    }

    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn(StageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Outputs, StageError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnStage::new(func)))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StageBody>> {
        self.bodies.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bodies.contains_key(name)
    }
}

/// Result of a single stage attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Success(Outputs),
    RetryableFailure(String),
    FatalFailure(String),
}

/// Runs one stage body under its timeout. Never retries on its own.
#[derive(Debug, Clone)]
pub struct StageExecutor {
    registry: Arc<StageRegistry>,
}

impl StageExecutor {
    pub fn new(registry: StageRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub async fn run(&self, stage: &StageDefinition, context: StageContext) -> StageOutcome {
        let Some(body) = self.registry.get(&stage.name) else {
            warn!(
                target: "mediaflow::stage",
                task_id = %context.task_id,
                stage = %stage.name,
                "no stage body registered"
            );
            return StageOutcome::FatalFailure(format!(
                "no stage body registered for `{}`",
                stage.name
            ));
        };

        let attempt = context.attempt_number;
        let task_id = context.task_id;
        let timeout = stage.timeout();

        // The body runs on its own task so a panic surfaces as a JoinError
        // instead of unwinding through the worker.
        let handle = tokio::spawn(async move { body.execute(context).await });
        let abort = handle.abort_handle();

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(outputs))) => StageOutcome::Success(outputs),
            Ok(Ok(Err(StageError::Retryable(reason)))) => StageOutcome::RetryableFailure(reason),
            Ok(Ok(Err(StageError::Fatal(reason)))) => StageOutcome::FatalFailure(reason),
            Ok(Err(join_err)) if join_err.is_panic() => {
                warn!(
                    target: "mediaflow::stage",
                    task_id = %task_id,
                    stage = %stage.name,
                    attempt,
                    "stage body panicked"
                );
                StageOutcome::FatalFailure("stage body panicked".into())
            }
            Ok(Err(join_err)) => StageOutcome::FatalFailure(format!(
                "stage body was cancelled: {join_err}"
            )),
            Err(_) => {
                abort.abort();
                let reason = format!("timed out after {}ms", stage.timeout_ms);
                debug!(
                    target: "mediaflow::stage",
                    task_id = %task_id,
                    stage = %stage.name,
                    attempt,
                    max_attempts = stage.max_attempts,
                    "{reason}"
                );
                if attempt >= stage.max_attempts {
                    StageOutcome::FatalFailure(reason)
                } else {
                    StageOutcome::RetryableFailure(reason)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn context(stage: &str, attempt: u32) -> StageContext {
        StageContext {
            task_id: TaskId::new(),
            owner_id: OwnerId::new("alice"),
            template_id: TemplateId::new("t"),
            stage_index: 0,
            stage_name: stage.into(),
            attempt_number: attempt,
            payload_reference: "uploads/a.png".into(),
            outputs: Outputs::new(),
        }
    }

    fn stage(name: &str, max_attempts: u32, timeout_ms: u64) -> StageDefinition {
        StageDefinition::new(name, 1, max_attempts, Duration::from_millis(timeout_ms))
    }

    fn executor() -> StageExecutor {
        let mut registry = StageRegistry::new();
        registry
            .register_fn("ok", |ctx: StageContext| async move {
                let mut outputs = Outputs::new();
                outputs.insert("ok".into(), format!("{}/{}", ctx.payload_reference, ctx.attempt_number));
                Ok(outputs)
            })
            .register_fn("flaky", |_ctx: StageContext| async move {
                Err::<Outputs, _>(StageError::Retryable("try later".into()))
            })
            .register_fn("broken", |_ctx: StageContext| async move {
                Err::<Outputs, _>(StageError::Fatal("bad input".into()))
            })
            .register_fn("slow", |_ctx: StageContext| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Outputs::new())
            })
            .register_fn("panics", |_ctx: StageContext| async move {
                if true {
                    panic!("boom");
                }
                Ok(Outputs::new())
            });
        StageExecutor::new(registry)
    }

    #[tokio::test]
    async fn body_results_map_to_outcomes() {
        let executor = executor();

        let outcome = executor.run(&stage("ok", 3, 1_000), context("ok", 2)).await;
        let StageOutcome::Success(outputs) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(outputs["ok"], "uploads/a.png/2");

        assert_eq!(
            executor.run(&stage("flaky", 3, 1_000), context("flaky", 1)).await,
            StageOutcome::RetryableFailure("try later".into())
        );
        assert_eq!(
            executor.run(&stage("broken", 3, 1_000), context("broken", 1)).await,
            StageOutcome::FatalFailure("bad input".into())
        );
    }

    #[tokio::test]
    async fn timeout_is_retryable_until_the_last_attempt() {
        let executor = executor();
        let slow = stage("slow", 2, 20);

        let first = executor.run(&slow, context("slow", 1)).await;
        assert!(matches!(first, StageOutcome::RetryableFailure(_)), "{first:?}");

        let last = executor.run(&slow, context("slow", 2)).await;
        assert!(matches!(last, StageOutcome::FatalFailure(_)), "{last:?}");
    }

    #[tokio::test]
    async fn missing_and_panicking_bodies_are_fatal() {
        let executor = executor();

        let missing = executor.run(&stage("unknown", 3, 1_000), context("unknown", 1)).await;
        assert!(matches!(missing, StageOutcome::FatalFailure(_)));

        let panicked = executor.run(&stage("panics", 3, 1_000), context("panics", 1)).await;
        assert_eq!(panicked, StageOutcome::FatalFailure("stage body panicked".into()));
    }
}
