use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use mediaflow_core::orchestration::{
    AdvanceOutcome, AttemptStart, MaintenanceScheduler, MemoryStore, NoJitter,
    OrchestratorConfig, OrchestratorStore, PipelineOrchestrator, RetryPolicy,
    StageOutcome, StageReport, StageWork,
};
use mediaflow_core::model::{
    FailureReason, Outputs, OwnerId, PipelineTemplate, StageDefinition,
    SubmitErrorCode, SubmitRequest, SubmitResponse, TaskStatus,
};
use mediaflow_core::{AdmissionError, SubmitError};

const OWNER: &str = "owner-1";

fn config(limit: u32, stages: Vec<StageDefinition>) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.quota.default_limit = limit;
    config.pipelines = vec![PipelineTemplate::new("test", stages)];
    config
}

fn two_stages(max_attempts: u32) -> Vec<StageDefinition> {
    vec![
        StageDefinition::new("transcode", 30, max_attempts, Duration::from_secs(5)),
        StageDefinition::new("publish", 70, max_attempts, Duration::from_secs(5)),
    ]
}

fn orchestrator_with(store: Arc<dyn OrchestratorStore>, config: OrchestratorConfig) -> PipelineOrchestrator {
    let retry = RetryPolicy::with_jitter(&config.retry, Arc::new(NoJitter));
    PipelineOrchestrator::with_retry_policy(config, store, retry).unwrap()
}

fn orchestrator(config: OrchestratorConfig) -> PipelineOrchestrator {
    orchestrator_with(Arc::new(MemoryStore::new()), config)
}

fn request() -> SubmitRequest {
    SubmitRequest {
        owner_id: OwnerId::new(OWNER),
        pipeline_template_id: "test".into(),
        payload_reference: "uploads/clip.mov".into(),
    }
}

fn outputs(key: &str, value: &str) -> Outputs {
    Outputs::from([(key.to_string(), value.to_string())])
}

/// Starts `work` and reports `outcome` for it.
async fn run(
    orchestrator: &PipelineOrchestrator,
    work: &StageWork,
    outcome: StageOutcome,
) -> AdvanceOutcome {
    let start = orchestrator.begin_attempt(work).await.unwrap();
    assert!(matches!(start, AttemptStart::Proceed { .. }), "attempt should start: {work:?}");
    orchestrator
        .advance(StageReport::new(work, outcome))
        .await
        .unwrap()
}

/// Runs every remaining stage of a task successfully.
async fn complete(orchestrator: &PipelineOrchestrator, first: StageWork) {
    let mut work = first;
    loop {
        match run(orchestrator, &work, StageOutcome::Success(Outputs::new())).await {
            AdvanceOutcome::Dispatch(next) => work = next,
            AdvanceOutcome::Terminal(TaskStatus::Completed) => return,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}

#[tokio::test]
async fn second_submission_is_rejected_until_the_first_completes() {
    let orchestrator = orchestrator(config(1, two_stages(3)));
    let owner = OwnerId::new(OWNER);

    let first = orchestrator.submit(request()).await.unwrap();
    run(
        &orchestrator,
        &first.work,
        StageOutcome::Success(Outputs::new()),
    )
    .await;

    let err = orchestrator.submit(request()).await.unwrap_err();
    assert_eq!(err.code(), SubmitErrorCode::QuotaExceeded);
    let SubmitError::Admission(AdmissionError::QuotaExceeded { task_id: rejected, limit, .. }) = &err else {
        panic!("expected quota rejection, got {err:?}");
    };
    assert_eq!(*limit, 1);

    // The rejected task is recorded with a single terminal event.
    let rejected_snapshot = orchestrator.snapshot(*rejected).await.unwrap();
    assert_eq!(rejected_snapshot.status, TaskStatus::Rejected);
    let rejected_events = orchestrator.events(*rejected, None).await.unwrap();
    assert_eq!(rejected_events.len(), 1);
    assert_eq!(rejected_events[0].sequence_number, 0);
    assert!(rejected_events[0].is_terminal());
    assert!(matches!(
        err.into_response(),
        SubmitResponse::Rejected { error: SubmitErrorCode::QuotaExceeded }
    ));

    let second_stage = StageWork {
        task_id: first.task_id,
        stage_index: 1,
        stage_name: "publish".into(),
        attempt_number: 1,
    };
    complete(&orchestrator, second_stage).await;
    assert_eq!(orchestrator.quota().entry(&owner).unwrap().active_count, 0);

    let third = orchestrator.submit(request()).await.unwrap();
    assert_eq!(orchestrator.snapshot(third.task_id).await.unwrap().status, TaskStatus::Queued);
    assert_eq!(orchestrator.quota().entry(&owner).unwrap().active_count, 1);
}

#[tokio::test]
async fn retried_stage_counts_its_weight_once() {
    let orchestrator = orchestrator(config(3, two_stages(3)));
    let submitted = orchestrator.submit(request()).await.unwrap();
    let task_id = submitted.task_id;

    let mut work = submitted.work;
    for expected_next in [2, 3] {
        match run(
            &orchestrator,
            &work,
            StageOutcome::RetryableFailure("encoder busy".into()),
        )
        .await
        {
            AdvanceOutcome::Retry { work: retry, delay } => {
                assert_eq!(retry.attempt_number, expected_next);
                assert_eq!(retry.stage_index, 0);
                assert!(delay <= Duration::from_secs(60));
                work = retry;
            }
            other => panic!("expected retry, got {other:?}"),
        }
        let snapshot = orchestrator.snapshot(task_id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Running);
        assert_eq!(snapshot.progress_percent, 0);
    }

    let next = match run(
        &orchestrator,
        &work,
        StageOutcome::Success(outputs("rendition", "clip.mp4")),
    )
    .await
    {
        AdvanceOutcome::Dispatch(next) => next,
        other => panic!("expected dispatch, got {other:?}"),
    };
    assert_eq!(orchestrator.snapshot(task_id).await.unwrap().progress_percent, 30);

    // Replaying the successful attempt changes nothing.
    let replay = StageReport::new(&work, StageOutcome::Success(Outputs::new()));
    assert_eq!(orchestrator.advance(replay).await.unwrap(), AdvanceOutcome::Ignored);
    assert_eq!(orchestrator.snapshot(task_id).await.unwrap().progress_percent, 30);

    complete(&orchestrator, next).await;

    let events = orchestrator.events(task_id, None).await.unwrap();
    assert!(events.iter().all(|e| e.status != TaskStatus::Failed));
    assert!(events.windows(2).all(|w| w[0].progress_percent <= w[1].progress_percent));
    assert!(
        events
            .iter()
            .enumerate()
            .all(|(i, e)| e.sequence_number == i as u64)
    );

    let last = events.last().unwrap();
    assert_eq!(last.status, TaskStatus::Completed);
    assert_eq!(last.progress_percent, 100);

    let snapshot = orchestrator.snapshot(task_id).await.unwrap();
    assert_eq!(snapshot.outputs.get("rendition").map(String::as_str), Some("clip.mp4"));
    assert_eq!(snapshot.current_stage, None);
}

#[tokio::test]
async fn exhausted_retries_fail_the_task_and_release_once() {
    let orchestrator = orchestrator(config(1, two_stages(3)));
    let owner = OwnerId::new(OWNER);
    let submitted = orchestrator.submit(request()).await.unwrap();

    let mut work = submitted.work;
    let mut attempts = 0;
    loop {
        attempts += 1;
        match run(
            &orchestrator,
            &work,
            StageOutcome::RetryableFailure("source unreachable".into()),
        )
        .await
        {
            AdvanceOutcome::Retry { work: retry, .. } => work = retry,
            AdvanceOutcome::Terminal(status) => {
                assert_eq!(status, TaskStatus::Failed);
                break;
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(attempts, 3);

    let snapshot = orchestrator.snapshot(submitted.task_id).await.unwrap();
    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert_eq!(snapshot.error, Some(FailureReason::stage_failed("transcode")));
    assert_eq!(snapshot.error.as_ref().map(ToString::to_string).as_deref(), Some("stage_failed:transcode"));
    assert_eq!(orchestrator.quota().entry(&owner).unwrap().active_count, 0);

    // A new task takes the freed slot; a duplicate report for the failed
    // task must not free it a second time.
    orchestrator.submit(request()).await.unwrap();
    let duplicate = StageReport::new(&work, StageOutcome::RetryableFailure("again".into()));
    assert_eq!(orchestrator.advance(duplicate).await.unwrap(), AdvanceOutcome::Ignored);
    assert_eq!(orchestrator.quota().entry(&owner).unwrap().active_count, 1);
    assert!(orchestrator.submit(request()).await.is_err());
}

#[tokio::test]
async fn fatal_failure_skips_remaining_attempts() {
    let orchestrator = orchestrator(config(1, two_stages(5)));
    let submitted = orchestrator.submit(request()).await.unwrap();

    let outcome = run(
        &orchestrator,
        &submitted.work,
        StageOutcome::FatalFailure("corrupt container".into()),
    )
    .await;
    assert_eq!(outcome, AdvanceOutcome::Terminal(TaskStatus::Failed));

    let events = orchestrator.events(submitted.task_id, None).await.unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.error, Some(FailureReason::stage_failed("transcode")));
    assert_eq!(last.stage_name.as_deref(), Some("transcode"));
    assert!(events.iter().all(|e| e.retry.is_none()));
}

#[tokio::test]
async fn late_subscriber_gets_backlog_before_live_events() {
    let stages = vec![
        StageDefinition::new("inspect", 50, 3, Duration::from_secs(5)),
        StageDefinition::new("package", 50, 3, Duration::from_secs(5)),
    ];
    let orchestrator = orchestrator(config(1, stages));
    let submitted = orchestrator.submit(request()).await.unwrap();

    let next = match run(
        &orchestrator,
        &submitted.work,
        StageOutcome::Success(Outputs::new()),
    )
    .await
    {
        AdvanceOutcome::Dispatch(next) => next,
        other => panic!("expected dispatch, got {other:?}"),
    };
    let snapshot = orchestrator.snapshot(submitted.task_id).await.unwrap();
    assert_eq!(snapshot.progress_percent, 50);

    let mut subscription = orchestrator.subscribe(submitted.task_id).await.unwrap();
    complete(&orchestrator, next).await;

    let mut received = Vec::new();
    while let Some(event) = subscription.next().await {
        received.push(event.unwrap());
    }

    let sequence: Vec<u64> = received.iter().map(|e| e.sequence_number).collect();
    assert_eq!(sequence, vec![0, 1, 2, 3]);
    assert_eq!(received[2].progress_percent, 50);
    assert_eq!(received[3].status, TaskStatus::Completed);

    // Resuming from a cursor only replays what came after it.
    let mut resumed = orchestrator.subscribe_after(submitted.task_id, 1).await.unwrap();
    let mut tail = Vec::new();
    while let Some(event) = resumed.next().await {
        tail.push(event.unwrap().sequence_number);
    }
    assert_eq!(tail, vec![2, 3]);
}

#[tokio::test]
async fn stalled_task_is_failed_by_maintenance() {
    let mut config = config(1, two_stages(3));
    config.maintenance.staleness_secs = 30;
    let orchestrator = Arc::new(orchestrator(config));
    let owner = OwnerId::new(OWNER);
    let scheduler = MaintenanceScheduler::new(Arc::clone(&orchestrator));

    let submitted = orchestrator.submit(request()).await.unwrap();
    orchestrator.begin_attempt(&submitted.work).await.unwrap();

    let report = scheduler
        .run_once(Utc::now() + TimeDelta::seconds(31))
        .await
        .unwrap();
    assert_eq!(report.stalled, vec![submitted.task_id]);

    let snapshot = orchestrator.snapshot(submitted.task_id).await.unwrap();
    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert_eq!(snapshot.error, Some(FailureReason::Stalled));
    assert_eq!(orchestrator.quota().entry(&owner).unwrap().active_count, 0);

    // The worker finishing afterwards cannot revive the task.
    let late = StageReport::new(&submitted.work, StageOutcome::Success(Outputs::new()));
    assert_eq!(orchestrator.advance(late).await.unwrap(), AdvanceOutcome::Ignored);
}

#[tokio::test]
async fn status_report_counts_recent_tasks() {
    let orchestrator = orchestrator(config(1, two_stages(3)));
    let first = orchestrator.submit(request()).await.unwrap();
    let _ = orchestrator.submit(request()).await;
    orchestrator.cancel(first.task_id).await.unwrap();
    orchestrator.begin_attempt(&first.work).await.unwrap();

    let report = orchestrator
        .status_report(Duration::from_secs(24 * 60 * 60))
        .await
        .unwrap();
    assert_eq!(report.count(TaskStatus::Failed), 1);
    assert_eq!(report.count(TaskStatus::Rejected), 1);
    assert_eq!(report.count(TaskStatus::Completed), 0);
    assert_eq!(report.total(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_and_completions_keep_quotas_exact() {
    const LIMIT: u32 = 2;
    const ROUNDS: usize = 40;
    let stages = vec![StageDefinition::new("encode", 100, 1, Duration::from_secs(5))];
    let orchestrator = Arc::new(orchestrator(config(LIMIT, stages)));
    let owners: Vec<OwnerId> = ["studio-a", "studio-b", "studio-c"]
        .into_iter()
        .map(OwnerId::new)
        .collect();

    let mut handles = Vec::new();
    for owner in &owners {
        for lane in 0..4 {
            let orchestrator = Arc::clone(&orchestrator);
            let owner = owner.clone();
            handles.push(tokio::spawn(async move {
                let mut finished = 0;
                for round in 0..ROUNDS {
                    let request = SubmitRequest {
                        owner_id: owner.clone(),
                        pipeline_template_id: "test".into(),
                        payload_reference: format!("uploads/{lane}-{round}.mov"),
                    };
                    let submitted = match orchestrator.submit(request).await {
                        Ok(submitted) => submitted,
                        Err(SubmitError::Admission(_)) => {
                            tokio::task::yield_now().await;
                            continue;
                        }
                        Err(err) => panic!("unexpected submit error {err}"),
                    };

                    let active = orchestrator.quota().entry(&owner).unwrap().active_count;
                    assert!(active <= LIMIT, "{owner} holds {active} slots");

                    let outcome = if (lane + round) % 3 == 0 {
                        StageOutcome::FatalFailure("bad frame".into())
                    } else {
                        StageOutcome::Success(Outputs::new())
                    };
                    match run(&orchestrator, &submitted.work, outcome).await {
                        AdvanceOutcome::Terminal(_) => finished += 1,
                        other => panic!("unexpected outcome {other:?}"),
                    }
                }
                finished
            }));
        }
    }

    let mut finished = 0;
    for handle in handles {
        finished += handle.await.unwrap();
    }
    assert!(finished > 0);

    for owner in &owners {
        assert_eq!(orchestrator.quota().entry(owner).unwrap().active_count, 0, "{owner}");
        assert_eq!(orchestrator.live_count(owner), 0, "{owner}");
    }
}

#[cfg(feature = "database")]
mod sqlite {
    use mediaflow_core::model::TaskId;
    use mediaflow_core::orchestration::{EventLog, SqliteStore, TaskStore};

    use super::*;

    async fn open(path: &std::path::Path) -> Arc<dyn OrchestratorStore> {
        let url = format!("sqlite://{}", path.display());
        Arc::new(SqliteStore::connect(&url, 2).await.unwrap())
    }

    async fn stored_status(store: &Arc<dyn OrchestratorStore>, task_id: TaskId) -> TaskStatus {
        store.load_task(task_id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn restart_resumes_in_flight_and_waiting_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mediaflow.db");
        let owner = OwnerId::new(OWNER);

        let (in_flight, waiting) = {
            let store = open(&path).await;
            let orchestrator = orchestrator_with(Arc::clone(&store), config(3, two_stages(3)));

            let in_flight = orchestrator.submit(request()).await.unwrap();
            orchestrator.begin_attempt(&in_flight.work).await.unwrap();

            let waiting = orchestrator.submit(request()).await.unwrap();
            let outcome = run(
                &orchestrator,
                &waiting.work,
                StageOutcome::RetryableFailure("throttled".into()),
            )
            .await;
            assert!(matches!(outcome, AdvanceOutcome::Retry { .. }));

            store.close().await;
            (in_flight, waiting)
        };

        let store = open(&path).await;
        let orchestrator = orchestrator_with(Arc::clone(&store), config(3, two_stages(3)));
        let report = orchestrator.recover().await.unwrap();
        assert_eq!(report.resumed.len(), 2);
        assert_eq!(orchestrator.live_count(&owner), 2);
        assert_eq!(orchestrator.quota().entry(&owner).unwrap().active_count, 2);

        let resumed_in_flight = report
            .resumed
            .iter()
            .find(|r| r.work.task_id == in_flight.task_id)
            .unwrap();
        assert_eq!(resumed_in_flight.work, in_flight.work);
        assert_eq!(resumed_in_flight.delay, Duration::ZERO);

        let resumed_waiting = report
            .resumed
            .iter()
            .find(|r| r.work.task_id == waiting.task_id)
            .unwrap();
        assert_eq!(resumed_waiting.work.attempt_number, 2);
        assert_eq!(resumed_waiting.work.stage_index, 0);

        // The in-flight attempt runs again under its original number and
        // the event sequence continues where it stopped.
        let outcome = run(
            &orchestrator,
            &resumed_in_flight.work,
            StageOutcome::Success(Outputs::new()),
        )
        .await;
        assert!(matches!(outcome, AdvanceOutcome::Dispatch(_)));
        let events = orchestrator.events(in_flight.task_id, None).await.unwrap();
        let sequence: Vec<u64> = events.iter().map(|e| e.sequence_number).collect();
        assert_eq!(sequence, vec![0, 1, 2]);

        store.close().await;
    }

    #[tokio::test]
    async fn failed_tasks_are_not_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mediaflow.db");

        let task_id = {
            let store = open(&path).await;
            let orchestrator = orchestrator_with(Arc::clone(&store), config(1, two_stages(1)));
            let submitted = orchestrator.submit(request()).await.unwrap();
            run(
                &orchestrator,
                &submitted.work,
                StageOutcome::FatalFailure("bad".into()),
            )
            .await;
            store.close().await;
            submitted.task_id
        };

        let store = open(&path).await;
        let orchestrator = orchestrator_with(Arc::clone(&store), config(1, two_stages(1)));
        let report = orchestrator.recover().await.unwrap();
        assert!(report.resumed.is_empty());
        assert_eq!(
            orchestrator.quota().entry(&OwnerId::new(OWNER)).unwrap().active_count,
            0
        );

        let snapshot = orchestrator.snapshot(task_id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        store.close().await;
    }

    #[tokio::test]
    async fn task_failed_by_another_process_stays_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mediaflow.db");
        let owner = OwnerId::new(OWNER);
        let mut shared = config(1, two_stages(3));
        shared.maintenance.staleness_secs = 30;

        // The long-running worker process.
        let worker_store = open(&path).await;
        let worker = orchestrator_with(Arc::clone(&worker_store), shared.clone());
        let submitted = worker.submit(request()).await.unwrap();
        worker.begin_attempt(&submitted.work).await.unwrap();

        // A standalone sweep against the same database.
        let sweep_store = open(&path).await;
        let sweeper = Arc::new(orchestrator_with(Arc::clone(&sweep_store), shared));
        sweeper.recover().await.unwrap();
        let report = MaintenanceScheduler::new(Arc::clone(&sweeper))
            .run_once(Utc::now() + TimeDelta::seconds(31))
            .await
            .unwrap();
        assert_eq!(report.stalled, vec![submitted.task_id]);

        assert_eq!(stored_status(&worker_store, submitted.task_id).await, TaskStatus::Failed);

        // The worker's late report collides with the sweep's terminal event.
        let late = StageReport::new(&submitted.work, StageOutcome::Success(Outputs::new()));
        let err = worker.advance(late).await.unwrap_err();
        assert!(err.is_conflict(), "{err}");
        assert_eq!(stored_status(&worker_store, submitted.task_id).await, TaskStatus::Failed);

        // Dispatching the attempt again from the stale record must not
        // overwrite the terminal row.
        let err = worker.begin_attempt(&submitted.work).await.unwrap_err();
        assert!(err.is_conflict(), "{err}");
        assert_eq!(stored_status(&worker_store, submitted.task_id).await, TaskStatus::Failed);

        assert!(worker.resync(submitted.task_id).await.unwrap().is_none());
        assert_eq!(worker.live_count(&owner), 0);
        assert_eq!(worker.quota().entry(&owner).unwrap().active_count, 0);
        assert!(matches!(
            worker.begin_attempt(&submitted.work).await.unwrap(),
            AttemptStart::Abandoned
        ));

        let snapshot = worker.snapshot(submitted.task_id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert_eq!(snapshot.error, Some(FailureReason::Stalled));

        let events = worker_store.load_events(submitted.task_id, None).await.unwrap();
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(events.last().map(|e| e.status), Some(TaskStatus::Failed));

        worker_store.close().await;
        sweep_store.close().await;
    }
}
