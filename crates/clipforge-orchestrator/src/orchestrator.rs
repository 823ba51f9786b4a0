//! The batch façade: admission, removal, runs and queries.

use crate::error::{OrchestrationError, Result};
use crate::priority::PriorityStrategy;
use crate::report::BatchReport;
use crate::scheduler::{CancelRegistry, Scheduler, SchedulerConfig};
use crate::state::LedgerState;
use chrono::Utc;
use clipforge_abstraction::{GenerationParameters, Generator};
use clipforge_core::{
    AggregateStats, BatchConfig, BudgetTracker, CostEstimator, EventBus, Job, JobEvent, JobObserver,
    JobRequest, JobStatus, JsonLedgerStore, LedgerStore, ProgressBoard, ProgressSnapshot,
    ValidationError, validate_request,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reason stored on jobs removed while pending.
pub const CANCELLED_BY_REQUEST: &str = "Cancelled by request";

/// Options for [`BatchOrchestrator::add_many`].
#[derive(Debug, Clone, Default)]
pub struct BulkAddOptions {
    /// Parameters every item inherits; the item's own values win.
    pub shared_parameters: Option<GenerationParameters>,
    /// Replaces every item's instruction.
    pub shared_instruction: Option<String>,
    /// Priority assignment; the configured strategy when unset.
    pub strategy: Option<PriorityStrategy>,
}

/// Result of a bulk insert.
#[derive(Debug, Clone, Default)]
pub struct BulkAddOutcome {
    /// Ids of admitted jobs, in input order.
    pub added: Vec<String>,
    /// Rejected items by input index.
    pub rejected: Vec<(usize, ValidationError)>,
}

/// Builder for [`BatchOrchestrator`].
pub struct BatchOrchestratorBuilder {
    config: BatchConfig,
    store: Option<Arc<dyn LedgerStore>>,
    generator: Option<Arc<dyn Generator>>,
    events: Option<Arc<EventBus>>,
    estimator: Option<CostEstimator>,
    observers: Vec<Arc<dyn JobObserver>>,
}

impl BatchOrchestratorBuilder {
    /// Ledger store; a JSON file at the configured ledger path by default.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Generator used by runs.
    #[must_use]
    pub fn generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Event bus to publish on.
    #[must_use]
    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Cost estimator; built from the configured pricing by default.
    #[must_use]
    pub fn estimator(mut self, estimator: CostEstimator) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Callback invoked on every event.
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Records completed job costs into `budget`.
    #[must_use]
    pub fn budget(self, budget: Arc<BudgetTracker>) -> Self {
        self.observer(budget)
    }

    /// Validates the configuration and loads the ledger.
    pub fn build(self) -> Result<BatchOrchestrator> {
        self.config.validate()?;

        let events = self.events.unwrap_or_else(|| Arc::new(EventBus::new(self.config.event_capacity)));
        for observer in self.observers {
            events.add_observer(observer);
        }
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(JsonLedgerStore::new(self.config.ledger_path())));
        let state = Arc::new(LedgerState::load(store, Arc::clone(&events))?);
        let progress =
            Arc::new(ProgressBoard::new(self.config.stages.clone()).with_events(Arc::clone(&events)));
        let estimator =
            self.estimator.unwrap_or_else(|| CostEstimator::new(self.config.pricing_table()));

        debug!(state = ?state, "Batch orchestrator ready");

        Ok(BatchOrchestrator {
            priority: PriorityStrategy::from(&self.config.priority),
            config: self.config,
            state,
            events,
            generator: self.generator,
            estimator,
            progress,
            cancels: Arc::new(CancelRegistry::default()),
            run_lock: tokio::sync::Mutex::new(()),
            run_token: Mutex::new(None),
        })
    }
}

/// Owns the ledger and coordinates admission, scheduling and reporting.
///
/// Every collaborator is passed in through the builder; nothing is global.
pub struct BatchOrchestrator {
    config: BatchConfig,
    state: Arc<LedgerState>,
    events: Arc<EventBus>,
    generator: Option<Arc<dyn Generator>>,
    estimator: CostEstimator,
    progress: Arc<ProgressBoard>,
    cancels: Arc<CancelRegistry>,
    priority: PriorityStrategy,
    run_lock: tokio::sync::Mutex<()>,
    run_token: Mutex<Option<CancellationToken>>,
}

impl BatchOrchestrator {
    /// Starts building an orchestrator for `config`.
    pub fn builder(config: BatchConfig) -> BatchOrchestratorBuilder {
        BatchOrchestratorBuilder {
            config,
            store: None,
            generator: None,
            events: None,
            estimator: None,
            observers: Vec::new(),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Cost estimator used at admission.
    pub fn estimator(&self) -> &CostEstimator {
        &self.estimator
    }

    fn prepare(&self, request: JobRequest) -> Job {
        let estimate = self.estimator.estimate(&request.backend, &request.parameters);
        Job::new(request, self.config.max_retries, estimate.amount, estimate.warning)
    }

    fn added_event(job: &Job) -> JobEvent {
        JobEvent::Added {
            job_id: job.id.clone(),
            priority: job.priority,
            backend: job.backend.clone(),
            estimated_cost: job.estimated_cost,
        }
    }

    /// Admits one job.
    ///
    /// # Arguments
    /// * `request` - Input, instruction, backend, parameters and priority
    ///
    /// # Returns
    /// The new job id. Nothing enters the ledger when validation fails.
    pub async fn add_job(&self, request: JobRequest) -> Result<String> {
        validate_request(&request, &self.config.known_backends)?;
        let job = self.prepare(request);
        let event = Self::added_event(&job);

        let id = self
            .state
            .transact(|ledger, events| {
                let id = ledger.insert(job);
                events.push(event);
                Ok(id)
            })
            .await?;

        info!(job_id = %id, "Job added");
        Ok(id)
    }

    /// Admits many jobs with one ledger write.
    ///
    /// Priorities come from the priority strategy by position in `requests`,
    /// so large imports do not starve work submitted on its own. Invalid
    /// items are reported instead of aborting the batch.
    pub async fn add_many(
        &self,
        requests: Vec<JobRequest>,
        options: &BulkAddOptions,
    ) -> Result<BulkAddOutcome> {
        let strategy = options.strategy.unwrap_or(self.priority);
        let mut jobs = Vec::new();
        let mut rejected = Vec::new();

        for (index, mut request) in requests.into_iter().enumerate() {
            if let Some(shared) = &options.shared_parameters {
                request.parameters = request.parameters.merged_over(shared);
            }
            if let Some(instruction) = &options.shared_instruction {
                request.instruction.clone_from(instruction);
            }
            request.priority = strategy.priority_for(index);

            match validate_request(&request, &self.config.known_backends) {
                Ok(()) => jobs.push(self.prepare(request)),
                Err(e) => {
                    warn!(index, input = %request.input_ref.display(), error = %e, "Skipping invalid item");
                    rejected.push((index, e));
                }
            }
        }

        if jobs.is_empty() {
            return Ok(BulkAddOutcome { added: Vec::new(), rejected });
        }

        let added = self
            .state
            .transact(|ledger, events| {
                let mut added = Vec::with_capacity(jobs.len());
                for job in jobs {
                    events.push(Self::added_event(&job));
                    added.push(ledger.insert(job));
                }
                Ok(added)
            })
            .await?;

        info!(added = added.len(), rejected = rejected.len(), "Bulk add finished");
        Ok(BulkAddOutcome { added, rejected })
    }

    /// Cancels a job.
    ///
    /// A pending job is cancelled at once. A processing job has its worker
    /// signalled and becomes cancelled when the worker observes it.
    ///
    /// # Returns
    /// `false` if `job_id` is unknown or already terminal.
    pub async fn remove_job(&self, job_id: &str) -> Result<bool> {
        let now = Utc::now();
        let cancels = Arc::clone(&self.cancels);

        let removed = self
            .state
            .transact(|ledger, events| {
                let Some(job) = ledger.get_mut(job_id) else {
                    debug!(job_id = %job_id, "Remove of unknown job");
                    return Ok(false);
                };
                match job.status {
                    JobStatus::Pending => {
                        job.cancel(CANCELLED_BY_REQUEST, now)?;
                        events.push(JobEvent::Cancelled {
                            job_id: job_id.to_string(),
                            reason: CANCELLED_BY_REQUEST.to_string(),
                        });
                        Ok(true)
                    }
                    JobStatus::Processing => {
                        let signalled = cancels.cancel(job_id);
                        if !signalled {
                            warn!(job_id = %job_id, "Processing job has no running worker");
                        }
                        Ok(signalled)
                    }
                    status => {
                        info!(job_id = %job_id, status = %status, "Job already finished, nothing to remove");
                        Ok(false)
                    }
                }
            })
            .await?;
        Ok(removed)
    }

    /// Deletes jobs from the ledger.
    ///
    /// # Arguments
    /// * `filter` - Only jobs in this status; every job when `None`
    ///
    /// # Returns
    /// Number of jobs deleted. Processing jobs are never deleted.
    pub async fn clear_queue(&self, filter: Option<JobStatus>) -> Result<usize> {
        let progress = Arc::clone(&self.progress);
        let cleared = self
            .state
            .transact(|ledger, events| {
                let mut removed = Vec::new();
                ledger.retain(|job| {
                    let hit = job.status != JobStatus::Processing
                        && filter.is_none_or(|status| job.status == status);
                    if hit {
                        removed.push(job.id.clone());
                    }
                    !hit
                });
                for job_id in &removed {
                    progress.remove(job_id);
                    events.push(JobEvent::Removed { job_id: job_id.clone() });
                }
                Ok(removed.len())
            })
            .await?;

        info!(cleared, filter = ?filter, "Queue cleared");
        Ok(cleared)
    }

    /// Drains the jobs pending right now.
    ///
    /// Jobs added while the run is in progress wait for the next run.
    /// Concurrent calls are serialized.
    ///
    /// # Arguments
    /// * `concurrency` - Worker slots, at least 1
    /// * `auto_retry` - Retry transient failures
    ///
    /// # Returns
    /// A report over the run set; empty, with no side effects, when nothing
    /// was pending.
    pub async fn run(&self, concurrency: usize, auto_retry: bool) -> Result<BatchReport> {
        if concurrency == 0 {
            return Err(OrchestrationError::InvalidConcurrency(concurrency));
        }
        let generator = self.generator.clone().ok_or(OrchestrationError::NoGenerator)?;
        let _run = self.run_lock.lock().await;

        let run_set: Vec<String> =
            self.state.read(|ledger| ledger.pending().map(|job| job.id.clone()).collect()).await;
        if run_set.is_empty() {
            debug!("Nothing pending, run skipped");
            return Ok(BatchReport::empty());
        }

        let shutdown = CancellationToken::new();
        *self.lock_run_token() = Some(shutdown.clone());
        let failed_writes = self.state.failed_writes();
        let started = Instant::now();

        info!(jobs = run_set.len(), concurrency, auto_retry, generator = generator.name(), "Run started");
        self.events.emit(JobEvent::RunStarted { jobs: run_set.len(), concurrency });

        let scheduler = Scheduler::new(
            Arc::clone(&self.state),
            generator,
            Arc::clone(&self.progress),
            Arc::clone(&self.cancels),
        );
        let scheduler_config = SchedulerConfig {
            concurrency,
            retry: self.config.retry_policy().with_enabled(auto_retry),
            job_timeout: self.config.job_timeout(),
        };
        scheduler.run(&run_set, &scheduler_config, shutdown).await;
        *self.lock_run_token() = None;

        let jobs: Vec<Job> = self
            .state
            .read(|ledger| run_set.iter().filter_map(|id| ledger.get(id).cloned()).collect())
            .await;
        let durable = self.state.failed_writes() == failed_writes;
        let report = BatchReport::from_jobs(&jobs, started.elapsed().as_secs_f64(), durable);

        if !durable {
            warn!("Some ledger writes failed during the run, results are not durably recorded");
        }
        info!(
            completed = report.completed,
            failed = report.failed,
            cancelled = report.cancelled,
            pending = report.pending,
            elapsed_secs = report.elapsed_secs,
            "Run finished"
        );
        self.events.emit(JobEvent::RunFinished {
            completed: report.completed,
            failed: report.failed,
            cancelled: report.cancelled,
        });
        Ok(report)
    }

    fn lock_run_token(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.run_token.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops the run in progress.
    ///
    /// No new job starts, running jobs are cancelled, and jobs still pending
    /// stay pending for the next run.
    ///
    /// # Returns
    /// Whether a run was in progress.
    pub fn cancel_run(&self) -> bool {
        match self.lock_run_token().as_ref() {
            Some(token) => {
                info!("Cancelling run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Aggregate snapshot of the whole ledger.
    pub async fn status(&self) -> AggregateStats {
        self.state.read(AggregateStats::from_ledger).await
    }

    /// One job, by id.
    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        self.state.read(|ledger| ledger.get(job_id).cloned()).await
    }

    /// Jobs in queue order.
    ///
    /// # Arguments
    /// * `filter` - Only jobs in this status
    /// * `limit` - At most this many jobs
    pub async fn list_jobs(&self, filter: Option<JobStatus>, limit: Option<usize>) -> Vec<Job> {
        self.state
            .read(|ledger| {
                ledger
                    .jobs()
                    .iter()
                    .filter(|job| filter.is_none_or(|status| job.status == status))
                    .take(limit.unwrap_or(usize::MAX))
                    .cloned()
                    .collect()
            })
            .await
    }

    /// Progress of the current or last attempt of `job_id`.
    pub fn progress(&self, job_id: &str) -> Option<ProgressSnapshot> {
        self.progress.snapshot(job_id)
    }

    /// Receiver of every future event.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Registers a callback invoked on every event.
    pub fn add_observer(&self, observer: Arc<dyn JobObserver>) {
        self.events.add_observer(observer);
    }

    /// Writes the ledger to its store.
    pub async fn flush(&self) -> Result<()> {
        self.state.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipforge_abstraction::mock::MockGenerator;
    use clipforge_core::MemoryLedgerStore;
    use tempfile::TempDir;

    fn orchestrator(generator: Option<Arc<MockGenerator>>) -> BatchOrchestrator {
        let mut builder = BatchOrchestrator::builder(BatchConfig::default())
            .store(Arc::new(MemoryLedgerStore::new()));
        if let Some(generator) = generator {
            builder = builder.generator(generator);
        }
        builder.build().unwrap()
    }

    fn input(dir: &TempDir, name: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"img").unwrap();
        path
    }

    #[tokio::test]
    async fn test_run_rejects_zero_concurrency() {
        let orchestrator = orchestrator(Some(Arc::new(MockGenerator::new())));
        let result = orchestrator.run(0, true).await;
        assert!(matches!(result, Err(OrchestrationError::InvalidConcurrency(0))));
    }

    #[tokio::test]
    async fn test_run_without_generator() {
        let orchestrator = orchestrator(None);
        assert!(matches!(orchestrator.run(1, true).await, Err(OrchestrationError::NoGenerator)));
    }

    #[tokio::test]
    async fn test_add_job_estimates_cost() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(None);
        let id = orchestrator
            .add_job(JobRequest::new(input(&dir, "a.png"), "pan left", "haiper_20").with_priority(4))
            .await
            .unwrap();

        let job = orchestrator.get_job(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 4);
        assert!(job.estimated_cost > 0.0);
        assert!(job.cost_warning.is_none());
    }

    #[tokio::test]
    async fn test_unknown_backend_costs_zero_with_warning() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(None);
        let id = orchestrator
            .add_job(JobRequest::new(input(&dir, "a.png"), "pan left", "mystery"))
            .await
            .unwrap();

        let job = orchestrator.get_job(&id).await.unwrap();
        assert_eq!(job.estimated_cost, 0.0);
        assert!(job.cost_warning.is_some());
    }

    #[tokio::test]
    async fn test_known_backends_allowlist() {
        let dir = TempDir::new().unwrap();
        let config = BatchConfig { known_backends: vec!["haiper_20".to_string()], ..Default::default() };
        let orchestrator =
            BatchOrchestrator::builder(config).store(Arc::new(MemoryLedgerStore::new())).build().unwrap();

        let err = orchestrator
            .add_job(JobRequest::new(input(&dir, "a.png"), "pan left", "mystery"))
            .await
            .unwrap_err();
        assert_eq!(err.as_validation(), Some(&ValidationError::UnknownBackend("mystery".to_string())));
    }

    #[tokio::test]
    async fn test_remove_terminal_and_unknown() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(None);
        let id = orchestrator
            .add_job(JobRequest::new(input(&dir, "a.png"), "pan left", "haiper_20"))
            .await
            .unwrap();

        assert!(orchestrator.remove_job(&id).await.unwrap());
        assert!(!orchestrator.remove_job(&id).await.unwrap());
        assert!(!orchestrator.remove_job("job-nope").await.unwrap());
        assert_eq!(orchestrator.get_job(&id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_clear_queue_by_status() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(None);
        let keep = orchestrator
            .add_job(JobRequest::new(input(&dir, "a.png"), "pan left", "haiper_20"))
            .await
            .unwrap();
        let drop = orchestrator
            .add_job(JobRequest::new(input(&dir, "b.png"), "pan left", "haiper_20"))
            .await
            .unwrap();
        orchestrator.remove_job(&drop).await.unwrap();

        assert_eq!(orchestrator.clear_queue(Some(JobStatus::Cancelled)).await.unwrap(), 1);
        assert!(orchestrator.get_job(&keep).await.is_some());
        assert!(orchestrator.get_job(&drop).await.is_none());

        assert_eq!(orchestrator.clear_queue(None).await.unwrap(), 1);
        assert_eq!(orchestrator.status().await, AggregateStats::default());
    }

    #[tokio::test]
    async fn test_cancel_run_without_run() {
        let orchestrator = orchestrator(None);
        assert!(!orchestrator.cancel_run());
    }
}
