//! End-to-end tests of admission, scheduling, retries and cancellation.

use clipforge_abstraction::GenerationParameters;
use clipforge_abstraction::mock::{MockGenerator, MockOutcome};
use clipforge_core::{
    BatchConfig, BudgetTracker, JobEvent, JobRequest, JobStatus, JsonLedgerStore, Ledger, LedgerStore,
    MemoryLedgerStore, RetrySettings, ValidationError,
};
use clipforge_orchestrator::{BatchOrchestrator, BulkAddOptions, OrchestrationError};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast::error::TryRecvError;

fn fast_config() -> BatchConfig {
    BatchConfig {
        retry: RetrySettings { base_delay_ms: 5, max_delay_ms: 20, multiplier: 2.0 },
        ..Default::default()
    }
}

fn orchestrator_with(config: BatchConfig, generator: &Arc<MockGenerator>) -> BatchOrchestrator {
    BatchOrchestrator::builder(config)
        .store(Arc::new(MemoryLedgerStore::new()))
        .generator(generator.clone())
        .build()
        .unwrap()
}

fn orchestrator(generator: &Arc<MockGenerator>) -> BatchOrchestrator {
    orchestrator_with(fast_config(), generator)
}

fn asset(dir: &TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, b"frame").unwrap();
    path
}

async fn add(orchestrator: &BatchOrchestrator, dir: &TempDir, name: &str, priority: u8) -> String {
    orchestrator
        .add_job(JobRequest::new(asset(dir, name), "slow dolly in", "kling_21_standard").with_priority(priority))
        .await
        .unwrap()
}

async fn wait_for_start(rx: &mut tokio::sync::broadcast::Receiver<JobEvent>) -> String {
    loop {
        if let JobEvent::Started { job_id, .. } = rx.recv().await.unwrap() {
            return job_id;
        }
    }
}

#[tokio::test]
async fn test_never_more_than_n_processing() {
    let dir = TempDir::new().unwrap();
    let generator = Arc::new(MockGenerator::new().with_latency(Duration::from_millis(30)));
    let orchestrator = orchestrator(&generator);

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    {
        let running = running.clone();
        let peak = peak.clone();
        orchestrator.add_observer(Arc::new(move |event: &JobEvent| match event {
            JobEvent::Started { .. } => {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
            }
            JobEvent::Completed { .. }
            | JobEvent::Failed { .. }
            | JobEvent::Cancelled { .. }
            | JobEvent::RetryScheduled { .. } => {
                running.fetch_sub(1, Ordering::SeqCst);
            }
            _ => {}
        }));
    }

    for i in 0..8 {
        add(&orchestrator, &dir, &format!("{i}.png"), 3).await;
    }
    let report = orchestrator.run(3, true).await.unwrap();

    assert_eq!(report.completed, 8);
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(generator.max_concurrency() <= 3);
    assert!(generator.max_concurrency() >= 2);
    assert_eq!(running.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_higher_priority_runs_first() {
    let dir = TempDir::new().unwrap();
    let generator = Arc::new(MockGenerator::new());
    let orchestrator = orchestrator(&generator);

    let mut ids = Vec::new();
    for (i, priority) in [1, 5, 1, 1, 1].into_iter().enumerate() {
        ids.push(add(&orchestrator, &dir, &format!("{i}.png"), priority).await);
    }
    orchestrator.run(1, true).await.unwrap();

    let calls = generator.calls();
    assert_eq!(calls[0], ids[1]);
    assert_eq!(calls[1..], [ids[0].clone(), ids[2].clone(), ids[3].clone(), ids[4].clone()]);
}

#[tokio::test]
async fn test_always_transient_exhausts_retries() {
    let dir = TempDir::new().unwrap();
    let generator = Arc::new(MockGenerator::always(MockOutcome::Transient("503".to_string())));
    let orchestrator = orchestrator(&generator);
    let id = add(&orchestrator, &dir, "a.png", 3).await;

    let report = orchestrator.run(2, true).await.unwrap();

    assert_eq!(generator.attempts_for(&id), 3);
    let job = orchestrator.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 2);
    assert!(job.error_message.unwrap().contains("503"));
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].job_id, id);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_transient_then_success() {
    let dir = TempDir::new().unwrap();
    let generator = Arc::new(MockGenerator::new());
    let orchestrator = orchestrator(&generator);
    let id = add(&orchestrator, &dir, "a.png", 3).await;
    generator.script_job(&id, [MockOutcome::Transient("429".to_string())]);

    let report = orchestrator.run(1, true).await.unwrap();

    let job = orchestrator.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 1);
    assert_eq!(report.total_retries, 1);
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn test_permanent_failure_skips_retry() {
    let dir = TempDir::new().unwrap();
    let generator = Arc::new(MockGenerator::always(MockOutcome::Permanent("rejected".to_string())));
    let orchestrator = orchestrator(&generator);
    let id = add(&orchestrator, &dir, "a.png", 3).await;

    orchestrator.run(1, true).await.unwrap();

    assert_eq!(generator.attempts_for(&id), 1);
    let job = orchestrator.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
}

#[tokio::test]
async fn test_auto_retry_off() {
    let dir = TempDir::new().unwrap();
    let generator = Arc::new(MockGenerator::always(MockOutcome::Transient("503".to_string())));
    let orchestrator = orchestrator(&generator);
    let id = add(&orchestrator, &dir, "a.png", 3).await;

    orchestrator.run(1, false).await.unwrap();

    assert_eq!(generator.attempts_for(&id), 1);
    assert_eq!(orchestrator.get_job(&id).await.unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn test_missing_input_is_rejected() {
    let dir = TempDir::new().unwrap();
    let generator = Arc::new(MockGenerator::new());
    let orchestrator = orchestrator(&generator);
    add(&orchestrator, &dir, "a.png", 3).await;

    let missing = dir.path().join("nope.png");
    let err = orchestrator
        .add_job(JobRequest::new(&missing, "pan", "kling_21_standard"))
        .await
        .unwrap_err();

    assert_eq!(err.as_validation(), Some(&ValidationError::MissingInput(missing)));
    assert_eq!(orchestrator.status().await.total, 1);
}

#[tokio::test]
async fn test_empty_instruction_is_rejected() {
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(&Arc::new(MockGenerator::new()));
    let err = orchestrator
        .add_job(JobRequest::new(asset(&dir, "a.png"), "   ", "kling_21_standard"))
        .await
        .unwrap_err();
    assert!(matches!(err.as_validation(), Some(ValidationError::EmptyInstruction)));
}

#[tokio::test]
async fn test_input_deleted_before_run_fails_permanently() {
    let dir = TempDir::new().unwrap();
    let generator = Arc::new(MockGenerator::new());
    let orchestrator = orchestrator(&generator);
    let id = add(&orchestrator, &dir, "a.png", 3).await;
    std::fs::remove_file(dir.path().join("a.png")).unwrap();

    let report = orchestrator.run(1, true).await.unwrap();

    assert!(generator.calls().is_empty());
    assert_eq!(report.failed, 1);
    assert_eq!(orchestrator.get_job(&id).await.unwrap().retry_count, 0);
}

#[tokio::test]
async fn test_cancelled_pending_job_is_not_in_report() {
    let dir = TempDir::new().unwrap();
    let generator = Arc::new(MockGenerator::new());
    let orchestrator = orchestrator(&generator);
    let keep = add(&orchestrator, &dir, "a.png", 3).await;
    let dropped = add(&orchestrator, &dir, "b.png", 3).await;

    assert!(orchestrator.remove_job(&dropped).await.unwrap());
    let report = orchestrator.run(2, true).await.unwrap();

    assert_eq!(report.total, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(report.cancelled, 0);
    assert_eq!(generator.calls(), vec![keep]);
}

#[tokio::test]
async fn test_second_run_is_empty_and_silent() {
    let dir = TempDir::new().unwrap();
    let generator = Arc::new(MockGenerator::new());
    let orchestrator = orchestrator(&generator);
    add(&orchestrator, &dir, "a.png", 3).await;
    orchestrator.run(1, true).await.unwrap();

    let mut rx = orchestrator.subscribe();
    let before = orchestrator.status().await;
    let report = orchestrator.run(1, true).await.unwrap();

    assert!(report.is_empty());
    assert_eq!(report.exit_code(), 0);
    assert_eq!(orchestrator.status().await, before);
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_remove_processing_job_cancels_it() {
    let dir = TempDir::new().unwrap();
    let generator = Arc::new(MockGenerator::always(MockOutcome::Hang));
    let orchestrator = Arc::new(orchestrator(&generator));
    let id = add(&orchestrator, &dir, "a.png", 3).await;

    let mut rx = orchestrator.subscribe();
    let run = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.run(1, true).await }
    });
    assert_eq!(wait_for_start(&mut rx).await, id);
    assert_eq!(orchestrator.get_job(&id).await.unwrap().status, JobStatus::Processing);

    assert!(orchestrator.remove_job(&id).await.unwrap());
    let report = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap().unwrap();

    assert_eq!(report.cancelled, 1);
    assert_eq!(report.exit_code(), 0);
    let job = orchestrator.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.retry_count, 0);
}

#[tokio::test]
async fn test_cancel_run_leaves_pending_jobs() {
    let dir = TempDir::new().unwrap();
    let generator = Arc::new(MockGenerator::always(MockOutcome::Hang));
    let orchestrator = Arc::new(orchestrator(&generator));
    let first = add(&orchestrator, &dir, "a.png", 5).await;
    let second = add(&orchestrator, &dir, "b.png", 1).await;

    let mut rx = orchestrator.subscribe();
    let run = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.run(1, true).await }
    });
    assert_eq!(wait_for_start(&mut rx).await, first);

    assert!(orchestrator.cancel_run());
    let report = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap().unwrap();

    assert_eq!(report.cancelled, 1);
    assert_eq!(report.pending, 1);
    assert_eq!(orchestrator.get_job(&second).await.unwrap().status, JobStatus::Pending);
    assert!(!orchestrator.cancel_run());
}

#[tokio::test]
async fn test_job_timeout_counts_as_failure() {
    let dir = TempDir::new().unwrap();
    let generator = Arc::new(MockGenerator::always(MockOutcome::Hang));
    let orchestrator = orchestrator(&generator);
    let request = JobRequest::new(asset(&dir, "a.png"), "pan", "kling_21_standard").with_parameters(
        GenerationParameters { timeout_secs: Some(1), ..Default::default() },
    );
    let id = orchestrator.add_job(request).await.unwrap();

    let report = orchestrator.run(1, false).await.unwrap();

    assert_eq!(report.failed, 1);
    let job = orchestrator.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.is_some());
}

#[tokio::test]
async fn test_events_are_ordered_per_job() {
    let dir = TempDir::new().unwrap();
    let generator = Arc::new(MockGenerator::new());
    let orchestrator = orchestrator(&generator);
    let mut rx = orchestrator.subscribe();
    let id = add(&orchestrator, &dir, "a.png", 3).await;
    orchestrator.run(1, true).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            JobEvent::Added { .. } => kinds.push("added"),
            JobEvent::Started { job_id, attempt } => {
                assert_eq!(job_id, id);
                assert_eq!(attempt, 1);
                kinds.push("started");
            }
            JobEvent::Completed { .. } => kinds.push("completed"),
            JobEvent::RunStarted { .. } => kinds.push("run_started"),
            JobEvent::RunFinished { completed, .. } => {
                assert_eq!(completed, 1);
                kinds.push("run_finished");
            }
            _ => {}
        }
    }
    assert_eq!(kinds, ["added", "run_started", "started", "completed", "run_finished"]);
}

#[tokio::test]
async fn test_bulk_add_decays_priority() {
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(&Arc::new(MockGenerator::new()));

    let mut requests: Vec<JobRequest> = (0..12)
        .map(|i| JobRequest::new(asset(&dir, &format!("{i}.png")), "", "kling_21_standard"))
        .collect();
    requests[3].input_ref = dir.path().join("missing.png");

    let options = BulkAddOptions {
        shared_instruction: Some("orbit the subject".to_string()),
        shared_parameters: Some(GenerationParameters { duration_secs: Some(10), ..Default::default() }),
        strategy: None,
    };
    let outcome = orchestrator.add_many(requests, &options).await.unwrap();

    assert_eq!(outcome.added.len(), 11);
    assert_eq!(outcome.rejected.len(), 1);
    assert_eq!(outcome.rejected[0].0, 3);

    let first = orchestrator.get_job(&outcome.added[0]).await.unwrap();
    let last = orchestrator.get_job(&outcome.added[10]).await.unwrap();
    assert_eq!(first.priority, 5);
    assert_eq!(last.priority, 4);
    assert_eq!(first.instruction, "orbit the subject");
    assert_eq!(first.parameters.duration_secs, Some(10));
}

#[tokio::test]
async fn test_completed_cost_reaches_budget() {
    let dir = TempDir::new().unwrap();
    let generator = Arc::new(MockGenerator::new().with_actual_cost(0.75));
    let budget = Arc::new(BudgetTracker::in_memory());
    let orchestrator = BatchOrchestrator::builder(fast_config())
        .store(Arc::new(MemoryLedgerStore::new()))
        .generator(generator)
        .budget(budget.clone())
        .build()
        .unwrap();
    let id = add(&orchestrator, &dir, "a.png", 3).await;

    let report = orchestrator.run(1, true).await.unwrap();

    assert!((report.incurred_cost - 0.75).abs() < 1e-9);
    let data = budget.data();
    assert_eq!(data.spending_history.len(), 1);
    assert_eq!(data.spending_history[0].description, id);
    assert!((data.total_spending - 0.75).abs() < 1e-9);
}

#[tokio::test]
async fn test_ledger_survives_restart() {
    let dir = TempDir::new().unwrap();
    let ledger_path = dir.path().join("ledger.json");
    let generator = Arc::new(MockGenerator::new());

    let (done, waiting) = {
        let orchestrator = BatchOrchestrator::builder(fast_config())
            .store(Arc::new(JsonLedgerStore::new(&ledger_path)))
            .generator(generator.clone())
            .build()
            .unwrap();
        let done = add(&orchestrator, &dir, "a.png", 3).await;
        orchestrator.run(1, true).await.unwrap();
        let waiting = add(&orchestrator, &dir, "b.png", 2).await;
        (orchestrator.get_job(&done).await.unwrap(), waiting)
    };

    let reopened = BatchOrchestrator::builder(fast_config())
        .store(Arc::new(JsonLedgerStore::new(&ledger_path)))
        .build()
        .unwrap();
    let restored = reopened.get_job(&done.id).await.unwrap();
    assert_eq!(restored.status, JobStatus::Completed);
    assert_eq!(restored.started_at, done.started_at);
    assert_eq!(restored.completed_at, done.completed_at);
    assert_eq!(restored.result, done.result);
    assert_eq!(restored.sequence, done.sequence);
    assert_eq!(reopened.get_job(&waiting).await.unwrap().status, JobStatus::Pending);
    assert_eq!(reopened.status().await.total, 2);
}

#[tokio::test]
async fn test_interrupted_job_is_requeued_on_load() {
    let dir = TempDir::new().unwrap();
    let ledger_path = dir.path().join("ledger.json");
    let store = JsonLedgerStore::new(&ledger_path);

    let mut ledger = Ledger::new();
    let id = ledger.insert(clipforge_core::Job::new(
        JobRequest::new(asset(&dir, "a.png"), "pan", "kling_21_standard"),
        2,
        0.25,
        None,
    ));
    ledger.get_mut(&id).unwrap().start(chrono::Utc::now()).unwrap();
    store.save(&ledger).unwrap();

    let generator = Arc::new(MockGenerator::new());
    let orchestrator = BatchOrchestrator::builder(fast_config())
        .store(Arc::new(JsonLedgerStore::new(&ledger_path)))
        .generator(generator.clone())
        .build()
        .unwrap();
    let job = orchestrator.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.started_at.is_none());

    let report = orchestrator.run(1, true).await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(generator.attempts_for(&id), 1);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_at_build() {
    let config = BatchConfig { concurrency: 0, ..Default::default() };
    let result = BatchOrchestrator::builder(config).store(Arc::new(MemoryLedgerStore::new())).build();
    assert!(matches!(result, Err(OrchestrationError::Config(_))));
}
