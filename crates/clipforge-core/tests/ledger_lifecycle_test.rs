//! Job lifecycle across the ledger, the JSON store and the derived stats.

use chrono::{Duration, Utc};
use clipforge_abstraction::{GenerationError, GenerationOutput};
use clipforge_core::{
    AggregateStats, BatchError, CostEstimator, Job, JobRequest, JobStatus, JsonLedgerStore, Ledger,
    LedgerStore, PricingTable, RetryDecision, RetryPolicy,
};
use tempfile::TempDir;

fn admit(ledger: &mut Ledger, estimator: &CostEstimator, input: &str, priority: u8) -> String {
    let request = JobRequest::new(input, "slow push in", "kling_21_pro").with_priority(priority);
    let estimate = estimator.estimate(&request.backend, &request.parameters);
    ledger.insert(Job::new(request, 2, estimate.amount, estimate.warning))
}

#[test]
fn test_queue_order_is_priority_then_admission() {
    let estimator = CostEstimator::new(PricingTable::builtin());
    let mut ledger = Ledger::new();
    let low = admit(&mut ledger, &estimator, "a.png", 1);
    let high = admit(&mut ledger, &estimator, "b.png", 5);
    let low_later = admit(&mut ledger, &estimator, "c.png", 1);

    let order: Vec<&str> = ledger.pending().map(|job| job.id.as_str()).collect();
    assert_eq!(order, [high.as_str(), low.as_str(), low_later.as_str()]);
}

#[test]
fn test_retry_cycle_then_terminal_failure() {
    let estimator = CostEstimator::new(PricingTable::builtin());
    let policy = RetryPolicy::default();
    let mut ledger = Ledger::new();
    let id = admit(&mut ledger, &estimator, "a.png", 3);
    let error = GenerationError::transient("gateway timeout");
    let now = Utc::now();

    let mut attempts = 0;
    loop {
        let job = ledger.get_mut(&id).unwrap();
        job.start(now).unwrap();
        attempts += 1;
        let decision = policy.on_failure(job, &error);
        job.fail(error.to_string(), now).unwrap();
        match decision {
            RetryDecision::Retry { retry_count, after } => {
                assert_eq!(after, policy.calculate_delay(retry_count));
                job.requeue(now + Duration::seconds(2)).unwrap();
                assert_eq!(job.retry_count, retry_count);
            }
            RetryDecision::GiveUp => break,
        }
    }

    let job = ledger.get_mut(&id).unwrap();
    assert_eq!(attempts, 3);
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.retry_count <= job.max_retries);
    assert!(matches!(
        job.requeue(now),
        Err(BatchError::RetriesExhausted { max_retries: 2, .. })
    ));
    assert!(matches!(job.start(now), Err(BatchError::InvalidTransition { .. })));
}

#[test]
fn test_store_round_trip_keeps_stats() {
    let dir = TempDir::new().unwrap();
    let store = JsonLedgerStore::new(dir.path().join("nested").join("ledger.json"));
    let estimator = CostEstimator::new(PricingTable::builtin());
    let mut ledger = Ledger::new();
    let now = Utc::now();

    let done = admit(&mut ledger, &estimator, "a.png", 3);
    let job = ledger.get_mut(&done).unwrap();
    job.start(now).unwrap();
    job.complete(
        GenerationOutput { actual_cost: Some(0.5), ..Default::default() },
        now + Duration::seconds(12),
    )
    .unwrap();
    let cancelled = admit(&mut ledger, &estimator, "b.png", 3);
    ledger.get_mut(&cancelled).unwrap().cancel("by request", now).unwrap();
    admit(&mut ledger, &estimator, "c.png", 3);

    store.save(&ledger).unwrap();
    let loaded = store.load().unwrap();

    assert_eq!(loaded.len(), 3);
    assert_eq!(loaded.next_sequence, ledger.next_sequence);
    for (before, after) in ledger.jobs().iter().zip(loaded.jobs()) {
        assert_eq!(before.id, after.id);
        assert_eq!(before.status, after.status);
        assert_eq!(before.created_at, after.created_at);
        assert_eq!(before.completed_at, after.completed_at);
        assert_eq!(before.error_message, after.error_message);
    }

    let stats = AggregateStats::from_ledger(&loaded);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.success_rate, 100.0);
    assert_eq!(stats.average_duration_secs, Some(12.0));
    assert!((stats.costs.incurred_total - 0.5).abs() < 1e-9);
    assert_eq!(stats.costs.by_backend["kling_21_pro"].jobs, 3);
}

#[test]
fn test_terminal_states_are_final() {
    let estimator = CostEstimator::new(PricingTable::builtin());
    let mut ledger = Ledger::new();
    let id = admit(&mut ledger, &estimator, "a.png", 3);
    let now = Utc::now();
    let job = ledger.get_mut(&id).unwrap();
    job.cancel("by request", now).unwrap();

    for status in JobStatus::ALL {
        assert!(!JobStatus::Cancelled.can_transition_to(status));
        assert!(!JobStatus::Completed.can_transition_to(status));
    }
    assert!(job.start(now).is_err());
    assert!(job.cancel("again", now).is_err());
    assert_eq!(job.error_message.as_deref(), Some("by request"));
}
