use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mediaflow_model::{SubmitRequest, TaskId};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::maintenance::MaintenanceScheduler;
use super::orchestrator::{
    AdvanceOutcome, AttemptStart, PipelineOrchestrator, RecoveryReport, StageReport,
};
use super::progress::ProgressSubscription;
use super::stage::{StageExecutor, StageRegistry};
use super::task::StageWork;
use crate::error::{OrchestratorError, Result, SubmitError};

/// State shared by every worker and timer.
#[derive(Clone)]
struct WorkerContext {
    orchestrator: Arc<PipelineOrchestrator>,
    executor: StageExecutor,
    work_tx: mpsc::Sender<StageWork>,
    shutdown: CancellationToken,
    redispatch_delay: Duration,
}

impl WorkerContext {
    /// Queues `work`, waiting for capacity on a background task when the
    /// queue is full.
    fn enqueue(&self, work: StageWork) {
        match self.work_tx.try_send(work) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(work)) => {
                let tx = self.work_tx.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        result = tx.send(work) => {
                            if let Err(err) = result {
                                debug!(target: "mediaflow::runtime", task_id = %err.0.task_id, "work queue closed");
                            }
                        }
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(work)) => {
                debug!(target: "mediaflow::runtime", task_id = %work.task_id, "work queue closed");
            }
        }
    }

    /// Queues `work` after `delay`. Pending timers are dropped at shutdown;
    /// recovery reschedules them from the stored retry time.
    fn schedule(&self, work: StageWork, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(work);
            return;
        }
        let ctx = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => ctx.enqueue(work),
            }
        });
    }

    /// Another writer committed for this task first; continue from what the
    /// store holds now.
    async fn resync(&self, work: StageWork, err: OrchestratorError) {
        warn!(
            target: "mediaflow::runtime",
            task_id = %work.task_id,
            stage = %work.stage_name,
            attempt = work.attempt_number,
            "task changed by another writer: {err}"
        );
        match self.orchestrator.resync(work.task_id).await {
            Ok(Some(resumed)) => self.schedule(resumed.work, resumed.delay),
            Ok(None) => {}
            Err(err) => {
                warn!(
                    target: "mediaflow::runtime",
                    task_id = %work.task_id,
                    "failed to reload task; dispatching again: {err}"
                );
                self.schedule(work, self.redispatch_delay);
            }
        }
    }

    async fn process(&self, work: StageWork) {
        let (stage, context) = match self.orchestrator.begin_attempt(&work).await {
            Ok(AttemptStart::Proceed { stage, context }) => (stage, context),
            Ok(AttemptStart::Abandoned) => return,
            Err(err) if err.is_conflict() => {
                self.resync(work, err).await;
                return;
            }
            Err(err) => {
                warn!(
                    target: "mediaflow::runtime",
                    task_id = %work.task_id,
                    stage = %work.stage_name,
                    attempt = work.attempt_number,
                    "failed to start attempt; dispatching again: {err}"
                );
                self.schedule(work, self.redispatch_delay);
                return;
            }
        };

        let outcome = self.executor.run(&stage, context).await;

        match self.orchestrator.advance(StageReport::new(&work, outcome)).await {
            Ok(AdvanceOutcome::Dispatch(next)) => self.enqueue(next),
            Ok(AdvanceOutcome::Retry { work, delay }) => self.schedule(work, delay),
            Ok(AdvanceOutcome::Terminal(_)) | Ok(AdvanceOutcome::Ignored) => {}
            Err(err) if err.is_conflict() => self.resync(work, err).await,
            Err(err) => {
                // Nothing was committed; the same attempt runs again.
                warn!(
                    target: "mediaflow::runtime",
                    task_id = %work.task_id,
                    stage = %work.stage_name,
                    attempt = work.attempt_number,
                    "failed to apply stage outcome; dispatching again: {err}"
                );
                self.schedule(work, self.redispatch_delay);
            }
        }
    }
}

/// Worker pool and housekeeping around a [`PipelineOrchestrator`].
///
/// Workers pull [`StageWork`] from a bounded queue, run the stage body
/// through the [`StageExecutor`], and feed the outcome back into the
/// orchestrator, which decides what runs next.
pub struct OrchestratorRuntime {
    ctx: WorkerContext,
    work_rx: Arc<Mutex<mpsc::Receiver<StageWork>>>,
    maintenance: Arc<MaintenanceScheduler>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl fmt::Debug for OrchestratorRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_handle_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("OrchestratorRuntime")
            .field("orchestrator", &self.ctx.orchestrator)
            .field("executor", &self.ctx.executor)
            .field("queued_work", &(self.ctx.work_tx.max_capacity() - self.ctx.work_tx.capacity()))
            .field("worker_handle_count", &worker_handle_count)
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("shutdown_cancelled", &self.ctx.shutdown.is_cancelled())
            .finish()
    }
}

impl OrchestratorRuntime {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>, registry: StageRegistry) -> Self {
        let capacity = orchestrator.config().workers.queue_capacity.max(1);
        let redispatch_delay = orchestrator.config().retry.backoff_base();
        let (work_tx, work_rx) = mpsc::channel(capacity);
        let maintenance = Arc::new(MaintenanceScheduler::new(Arc::clone(&orchestrator)));

        Self {
            ctx: WorkerContext {
                orchestrator,
                executor: StageExecutor::new(registry),
                work_tx,
                shutdown: CancellationToken::new(),
                redispatch_delay,
            },
            work_rx: Arc::new(Mutex::new(work_rx)),
            maintenance,
            worker_handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn orchestrator(&self) -> Arc<PipelineOrchestrator> {
        Arc::clone(&self.ctx.orchestrator)
    }

    pub fn maintenance(&self) -> Arc<MaintenanceScheduler> {
        Arc::clone(&self.maintenance)
    }

    /// Recovers persisted tasks, then starts the workers and the maintenance
    /// scheduler. Recovered work is queued before any new submission can be.
    pub async fn start(&self) -> Result<RecoveryReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::Internal("runtime already started".into()));
        }

        self.warn_missing_bodies();

        let report = self.ctx.orchestrator.recover().await?;
        for resumed in &report.resumed {
            self.ctx.schedule(resumed.work.clone(), resumed.delay);
        }

        let parallelism = self.ctx.orchestrator.config().workers.parallelism.max(1);
        let mut handles = self.worker_handles.lock().await;
        for worker_id in 0..parallelism {
            handles.push(self.spawn_worker(worker_id));
        }
        handles.push(
            Arc::clone(&self.maintenance).spawn(self.ctx.shutdown.clone()),
        );

        info!(
            target: "mediaflow::runtime",
            workers = parallelism,
            resumed = report.resumed.len(),
            "orchestrator runtime started"
        );
        Ok(report)
    }

    fn warn_missing_bodies(&self) {
        let registry = self.ctx.executor.registry();
        for template in self.ctx.orchestrator.catalog().iter() {
            for stage in &template.stages {
                if !registry.contains(&stage.name) {
                    warn!(
                        target: "mediaflow::runtime",
                        template = %template.id,
                        stage = %stage.name,
                        "no stage body registered; tasks will fail at this stage"
                    );
                }
            }
        }
    }

    fn spawn_worker(&self, worker_id: usize) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let work_rx = Arc::clone(&self.work_rx);

        tokio::spawn(async move {
            debug!(target: "mediaflow::runtime", worker_id, "worker started");
            loop {
                let next = tokio::select! {
                    _ = ctx.shutdown.cancelled() => None,
                    work = async { work_rx.lock().await.recv().await } => work,
                };
                let Some(work) = next else {
                    break;
                };
                ctx.process(work).await;
            }
            debug!(target: "mediaflow::runtime", worker_id, "worker stopped");
        })
    }

    /// Submits a task and queues its first stage.
    pub async fn submit(&self, request: SubmitRequest) -> std::result::Result<TaskId, SubmitError> {
        if self.ctx.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown.into());
        }
        let submitted = self.ctx.orchestrator.submit(request).await?;
        self.ctx.enqueue(submitted.work);
        Ok(submitted.task_id)
    }

    pub async fn cancel(&self, task_id: TaskId) -> Result<bool> {
        self.ctx.orchestrator.cancel(task_id).await
    }

    pub async fn subscribe(&self, task_id: TaskId) -> Result<ProgressSubscription> {
        self.ctx.orchestrator.subscribe(task_id).await
    }

    /// Stops accepting work, then waits up to the configured grace period
    /// for workers to finish their current attempt.
    ///
    /// Attempts still running when the grace period ends are abandoned; their
    /// tasks resume from the last committed state on the next start.
    pub async fn shutdown(&self) {
        info!(target: "mediaflow::runtime", "initiating graceful shutdown of orchestrator runtime");
        self.ctx.shutdown.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let grace = self.ctx.orchestrator.config().workers.shutdown_grace();
        let deadline = tokio::time::Instant::now() + grace;
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(target: "mediaflow::runtime", "worker task failed: {err}"),
                Err(_) => {
                    warn!(target: "mediaflow::runtime", "worker still busy after shutdown grace; aborting");
                    handle.abort();
                }
            }
        }

        info!(target: "mediaflow::runtime", "orchestrator runtime shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::config::OrchestratorConfig;
    use crate::orchestration::stage::{StageContext, StageError};
    use crate::orchestration::store::{EventLog, MemoryStore, TaskStore};
    use mediaflow_model::{
        FailureReason, Outputs, OwnerId, PipelineTemplate, StageDefinition, TaskStatus,
    };

    fn config() -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.retry.backoff_base_ms = 5;
        config.retry.backoff_max_ms = 20;
        config.workers.parallelism = 2;
        config.pipelines = vec![PipelineTemplate::new(
            "pair",
            vec![
                StageDefinition::new("one", 50, 3, Duration::from_secs(1)),
                StageDefinition::new("two", 50, 3, Duration::from_secs(1)),
            ],
        )];
        config
    }

    fn request() -> SubmitRequest {
        SubmitRequest {
            owner_id: OwnerId::new("alice"),
            pipeline_template_id: "pair".into(),
            payload_reference: "uploads/a".into(),
        }
    }

    async fn wait_terminal(runtime: &OrchestratorRuntime, task_id: TaskId) -> Vec<TaskStatus> {
        let mut subscription = runtime.subscribe(task_id).await.unwrap();
        let mut statuses = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = subscription.next().await {
                statuses.push(event.unwrap().status);
            }
        })
        .await
        .unwrap();
        statuses
    }

    #[tokio::test]
    async fn runs_every_stage_to_completion() {
        let mut registry = StageRegistry::new();
        registry
            .register_fn("one", |_ctx: StageContext| async move {
                Ok::<_, StageError>(Outputs::from([("first".to_string(), "done".to_string())]))
            })
            .register_fn("two", |ctx: StageContext| async move {
                match ctx.outputs.get("first").map(String::as_str) {
                    Some("done") => Ok(Outputs::new()),
                    other => Err(StageError::Fatal(format!("missing upstream output: {other:?}"))),
                }
            });

        let orchestrator =
            Arc::new(PipelineOrchestrator::new(config(), Arc::new(MemoryStore::new())).unwrap());
        let runtime = OrchestratorRuntime::new(Arc::clone(&orchestrator), registry);
        runtime.start().await.unwrap();

        let task_id = runtime.submit(request()).await.unwrap();
        let statuses = wait_terminal(&runtime, task_id).await;
        assert_eq!(statuses.last(), Some(&TaskStatus::Completed));

        let snapshot = orchestrator.snapshot(task_id).await.unwrap();
        assert_eq!(snapshot.progress_percent, 100);
        assert_eq!(snapshot.outputs.get("first").map(String::as_str), Some("done"));
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn retries_then_fails_when_budget_is_spent() {
        let mut registry = StageRegistry::new();
        registry
            .register_fn("one", |_ctx: StageContext| async move {
                Err::<Outputs, _>(StageError::Retryable("busy".into()))
            })
            .register_fn("two", |_ctx: StageContext| async move { Ok::<_, StageError>(Outputs::new()) });

        let orchestrator =
            Arc::new(PipelineOrchestrator::new(config(), Arc::new(MemoryStore::new())).unwrap());
        let runtime = OrchestratorRuntime::new(Arc::clone(&orchestrator), registry);
        runtime.start().await.unwrap();

        let task_id = runtime.submit(request()).await.unwrap();
        wait_terminal(&runtime, task_id).await;

        let snapshot = orchestrator.snapshot(task_id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert_eq!(snapshot.error, Some(FailureReason::stage_failed("one")));

        let retries = orchestrator
            .events(task_id, None)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.retry.is_some())
            .count();
        assert_eq!(retries, 2);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn task_failed_by_another_writer_is_not_revived() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let mut registry = StageRegistry::new();
        let stage_gate = Arc::clone(&gate);
        registry
            .register_fn("one", move |_ctx: StageContext| {
                let gate = Arc::clone(&stage_gate);
                async move {
                    gate.notified().await;
                    Ok::<_, StageError>(Outputs::new())
                }
            })
            .register_fn("two", |_ctx: StageContext| async move { Ok::<_, StageError>(Outputs::new()) });

        let store = Arc::new(MemoryStore::new());
        let orchestrator =
            Arc::new(PipelineOrchestrator::new(config(), store.clone()).unwrap());
        let runtime = OrchestratorRuntime::new(Arc::clone(&orchestrator), registry);
        runtime.start().await.unwrap();
        let task_id = runtime.submit(request()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while orchestrator.snapshot(task_id).await.unwrap().status != TaskStatus::Running {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let other = PipelineOrchestrator::new(config(), store.clone()).unwrap();
        other.recover().await.unwrap();
        assert!(other.force_fail(task_id, FailureReason::Stalled).await.unwrap());
        gate.notify_one();

        let owner = OwnerId::new("alice");
        tokio::time::timeout(Duration::from_secs(5), async {
            while orchestrator.live_count(&owner) > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stored = store.load_task(task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error, Some(FailureReason::Stalled));
        let events = store.load_events(task_id, None).await.unwrap();
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(orchestrator.quota().entry(&owner).unwrap().active_count, 0);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_refused() {
        let orchestrator =
            Arc::new(PipelineOrchestrator::new(config(), Arc::new(MemoryStore::new())).unwrap());
        let runtime = OrchestratorRuntime::new(orchestrator, StageRegistry::new());
        runtime.start().await.unwrap();
        runtime.shutdown().await;

        let err = runtime.submit(request()).await.unwrap_err();
        assert!(matches!(
            err,
            SubmitError::Orchestrator(OrchestratorError::ShuttingDown)
        ));
    }
}
