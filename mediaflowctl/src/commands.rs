use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::Utc;
use mediaflow_config::AppConfig;
use mediaflow_core::SubmitError;
use mediaflow_core::model::{
    OwnerId, SubmitRequest, SubmitResponse, TaskId, TaskStatus, TemplateId,
};
use mediaflow_core::orchestration::{
    Backend, MaintenanceScheduler, OrchestratorRuntime, PipelineOrchestrator,
    SubscriptionError,
};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::cli::{Command, ConfigCommand, RunArgs, SubmitArgs};
use crate::demo::{self, DemoSettings};

pub async fn dispatch(command: Command, config: &AppConfig) -> anyhow::Result<()> {
    match command {
        Command::Run(args) => run(config, args).await,
        Command::Submit(args) => submit(config, args).await,
        Command::Sweep => with_orchestrator(config, sweep).await,
        Command::Status { task_id } => {
            with_orchestrator(config, move |orchestrator| status(orchestrator, task_id)).await
        }
        Command::Events { task_id, after } => {
            with_orchestrator(config, move |orchestrator| events(orchestrator, task_id, after)).await
        }
        Command::Report { window } => {
            let window = window.unwrap_or_else(|| config.orchestrator.maintenance.report_window());
            with_orchestrator(config, move |orchestrator| report(orchestrator, window)).await
        }
        Command::Config {
            command: ConfigCommand::Check,
        } => config_check(config),
    }
}

fn print_line<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn print_pretty<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_backend(config: &AppConfig) -> anyhow::Result<(Backend, Arc<PipelineOrchestrator>)> {
    let backend = Backend::open(&config.orchestrator.storage)
        .await
        .context("failed to open storage backend")?;
    let orchestrator = PipelineOrchestrator::new(config.orchestrator.clone(), backend.store())
        .context("failed to build orchestrator")?;
    Ok((backend, Arc::new(orchestrator)))
}

/// Opens the backend, runs `op` and closes the backend whatever the outcome.
async fn with_orchestrator<F, Fut>(config: &AppConfig, op: F) -> anyhow::Result<()>
where
    F: FnOnce(Arc<PipelineOrchestrator>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let (backend, orchestrator) = open_backend(config).await?;
    if !backend.is_durable() {
        warn!("no database configured; inspecting an empty in-memory store");
    }
    let result = op(orchestrator).await;
    backend.close().await;
    result
}

async fn run(config: &AppConfig, args: RunArgs) -> anyhow::Result<()> {
    let (backend, orchestrator) = open_backend(config).await?;
    let registry = demo::media_registry(DemoSettings {
        failure_rate: args.failure_rate,
        time_scale: args.time_scale,
    });
    let runtime = OrchestratorRuntime::new(Arc::clone(&orchestrator), registry);

    let result = async {
        let recovery = runtime
            .start()
            .await
            .context("failed to start orchestrator runtime")?;
        info!(
            resumed = recovery.resumed.len(),
            quota_adjustments = recovery.quota_adjustments.len(),
            "recovery complete"
        );

        match args.demo {
            Some(count) => run_demo(&runtime, count, args.owners.max(1)).await,
            None => {
                info!("orchestrator running; press Ctrl-C to stop");
                tokio::signal::ctrl_c()
                    .await
                    .context("failed to listen for shutdown signal")
            }
        }
    }
    .await;

    runtime.shutdown().await;
    backend.close().await;
    result
}

async fn run_demo(runtime: &OrchestratorRuntime, count: u32, owners: u32) -> anyhow::Result<()> {
    let mut watchers = JoinSet::new();

    for index in 0..count {
        let request = SubmitRequest {
            owner_id: OwnerId::new(format!("demo-{}", index % owners + 1)),
            pipeline_template_id: TemplateId::new("media"),
            payload_reference: format!("uploads/demo-{index}.mov"),
        };

        match runtime.submit(request).await {
            Ok(task_id) => {
                print_line(&SubmitResponse::Accepted { task_id })?;
                let subscription = runtime.subscribe(task_id).await?;
                watchers.spawn(watch(runtime.orchestrator(), subscription));
            }
            Err(SubmitError::Orchestrator(err)) => {
                return Err(err).context("demo submission failed");
            }
            Err(err) => print_line(&err.into_response())?,
        }
    }

    let mut completed = 0usize;
    let mut failed = 0usize;
    let drain = async {
        while let Some(joined) = watchers.join_next().await {
            match joined.context("progress watcher failed")?? {
                TaskStatus::Completed => completed += 1,
                _ => failed += 1,
            }
        }
        anyhow::Ok(())
    };

    tokio::select! {
        drained = drain => drained?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            warn!("interrupted; unfinished demo tasks resume on the next run");
            return Ok(());
        }
    }

    info!(completed, failed, "demo finished");
    Ok(())
}

/// Streams one task's live updates to stdout until its terminal event.
async fn watch(
    orchestrator: Arc<PipelineOrchestrator>,
    mut subscription: mediaflow_core::orchestration::ProgressSubscription,
) -> anyhow::Result<TaskStatus> {
    let task_id = subscription.task_id();
    loop {
        match subscription.next().await {
            Some(Ok(event)) => {
                print_line(&event.to_live_update())?;
                if event.is_terminal() {
                    return Ok(event.status);
                }
            }
            Some(Err(SubscriptionError::Lagged { resume_after })) => {
                warn!(%task_id, ?resume_after, "progress watcher lagged; resubscribing");
                subscription = match resume_after {
                    Some(cursor) => orchestrator.subscribe_after(task_id, cursor).await?,
                    None => orchestrator.subscribe(task_id).await?,
                };
            }
            Some(Err(err)) => return Err(err.into()),
            None => bail!("progress stream for task {task_id} ended without a terminal event"),
        }
    }
}

async fn submit(config: &AppConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let (backend, orchestrator) = open_backend(config).await?;
    if !backend.is_durable() {
        backend.close().await;
        bail!(
            "submit needs a database; set MEDIAFLOW_DATABASE_URL or storage.database_url so `mediaflowctl run` can pick the task up"
        );
    }

    let result = async {
        // Seeds the quota ledger from persisted tasks before admitting.
        orchestrator
            .recover()
            .await
            .context("failed to load persisted tasks")?;

        let request = SubmitRequest {
            owner_id: OwnerId::new(args.owner),
            pipeline_template_id: TemplateId::new(args.template),
            payload_reference: args.payload,
        };
        match orchestrator.submit(request).await {
            Ok(submitted) => print_line(&SubmitResponse::Accepted {
                task_id: submitted.task_id,
            }),
            Err(err) => {
                print_line(&SubmitResponse::Rejected { error: err.code() })?;
                Err(anyhow::Error::new(err).context("submission rejected"))
            }
        }
    }
    .await;

    backend.close().await;
    result
}

async fn sweep(orchestrator: Arc<PipelineOrchestrator>) -> anyhow::Result<()> {
    orchestrator
        .recover()
        .await
        .context("failed to load persisted tasks")?;
    let report = MaintenanceScheduler::new(orchestrator)
        .run_once(Utc::now())
        .await
        .context("maintenance pass failed")?;

    let quota_adjusted: Vec<_> = report
        .quota_adjusted
        .iter()
        .map(|adjustment| {
            json!({
                "owner_id": adjustment.owner_id,
                "previous": adjustment.previous,
                "current": adjustment.current,
            })
        })
        .collect();
    print_pretty(&json!({
        "stalled": report.stalled,
        "quota_adjusted": quota_adjusted,
        "purged": report.purged,
    }))
}

async fn status(orchestrator: Arc<PipelineOrchestrator>, task_id: TaskId) -> anyhow::Result<()> {
    let snapshot = orchestrator.snapshot(task_id).await?;
    print_pretty(&snapshot)
}

async fn events(
    orchestrator: Arc<PipelineOrchestrator>,
    task_id: TaskId,
    after: Option<u64>,
) -> anyhow::Result<()> {
    let events = orchestrator.events(task_id, after).await?;
    if events.is_empty() {
        // Distinguishes "nothing newer" from an unknown task.
        orchestrator.snapshot(task_id).await?;
    }
    for event in &events {
        print_line(event)?;
    }
    Ok(())
}

async fn report(orchestrator: Arc<PipelineOrchestrator>, window: Duration) -> anyhow::Result<()> {
    let report = orchestrator.status_report(window).await?;
    print_pretty(&report)
}

fn config_check(config: &AppConfig) -> anyhow::Result<()> {
    let orchestrator = &config.orchestrator;
    let source = config
        .metadata
        .config_path
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "built-in defaults".to_string());

    println!("configuration: {source}");
    println!("env file loaded: {}", config.metadata.env_file_loaded);
    println!(
        "database: {}",
        orchestrator.storage.database_url.as_deref().unwrap_or("in-memory")
    );
    println!("default active task limit: {}", orchestrator.quota.default_limit);
    for (owner_id, limit) in &orchestrator.quota.overrides {
        println!("  override {owner_id}: {limit}");
    }
    println!(
        "workers: {} (queue capacity {})",
        orchestrator.workers.parallelism, orchestrator.workers.queue_capacity
    );
    println!(
        "staleness: {}",
        humantime::format_duration(orchestrator.maintenance.staleness())
    );
    for template in &orchestrator.pipelines {
        let stages: Vec<&str> = template.stages.iter().map(|stage| stage.name.as_str()).collect();
        println!("pipeline {}: {}", template.id, stages.join(" -> "));
    }
    println!("logging filter: {}", config.logging.filter);
    Ok(())
}
