//! Bounded worker pool that drains a run set in priority order.
//!
//! A slot is acquired first, then the best eligible job of the run set is
//! picked and started under the ledger lock. The slot travels with the job's
//! task and is released when that task has recorded its outcome, so no more
//! than `concurrency` jobs are ever `processing` at once.

use crate::state::LedgerState;
use chrono::{DateTime, Utc};
use clipforge_abstraction::{
    GenerationContext, GenerationError, GenerationOutput, Generator, ProgressSink,
};
use clipforge_core::validation::check_input_readable;
use clipforge_core::{BatchError, Job, JobEvent, JobStatus, ProgressBoard, RetryDecision, RetryPolicy};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reason stored on jobs cancelled while running.
pub const CANCELLED_WHILE_RUNNING: &str = "Cancelled while running";

/// Scheduler settings for one run.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker slots.
    pub concurrency: usize,
    /// Retry policy for failed attempts.
    pub retry: RetryPolicy,
    /// Timeout for one generator call, unless the job sets its own.
    pub job_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { concurrency: 3, retry: RetryPolicy::default(), job_timeout: None }
    }
}

/// Cancellation tokens of running jobs, by job id.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates and stores a fresh token for `job_id`.
    pub fn register(&self, job_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock().insert(job_id.to_string(), token.clone());
        token
    }

    /// Fires the token of `job_id`.
    ///
    /// # Returns
    /// Whether the job had a token.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.lock().get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Fires every token.
    pub fn cancel_all(&self) -> usize {
        let tokens = self.lock();
        for token in tokens.values() {
            token.cancel();
        }
        tokens.len()
    }

    /// Drops the token of `job_id`.
    pub fn remove(&self, job_id: &str) {
        self.lock().remove(job_id);
    }

    /// Number of registered tokens.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no job is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// What the admission step found.
enum Admission {
    /// A job was started.
    Started(Box<Job>, CancellationToken),
    /// Run-set jobs are pending but none is eligible yet.
    Wait(Option<DateTime<Utc>>),
    /// No run-set job is pending.
    Drained,
}

/// How one execution ended, before the retry policy is applied.
type Outcome = Result<GenerationOutput, GenerationError>;

/// Drives jobs through a generator under a concurrency cap.
pub struct Scheduler {
    state: Arc<LedgerState>,
    generator: Arc<dyn Generator>,
    progress: Arc<ProgressBoard>,
    cancels: Arc<CancelRegistry>,
}

impl Scheduler {
    /// Creates a scheduler.
    ///
    /// # Arguments
    /// * `state` - Shared ledger
    /// * `generator` - Performs the generation calls
    /// * `progress` - Receives generator progress
    /// * `cancels` - Registry shared with whoever cancels running jobs
    pub fn new(
        state: Arc<LedgerState>,
        generator: Arc<dyn Generator>,
        progress: Arc<ProgressBoard>,
        cancels: Arc<CancelRegistry>,
    ) -> Self {
        Self { state, generator, progress, cancels }
    }

    /// Runs until every job of `run_set` has left `pending` for good, or
    /// until `shutdown` fires.
    ///
    /// On shutdown no new job starts, running jobs are cancelled, and jobs
    /// still pending stay pending.
    pub async fn run(&self, run_set: &[String], config: &SchedulerConfig, shutdown: CancellationToken) {
        let run_set: HashSet<String> = run_set.iter().cloned().collect();
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let mut tasks: JoinSet<()> = JoinSet::new();

        debug!(jobs = run_set.len(), concurrency = config.concurrency, "Scheduler started");

        loop {
            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }
            if shutdown.is_cancelled() {
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!(error = %e, "Worker semaphore closed");
                        break;
                    }
                },
                () = shutdown.cancelled() => break,
            };

            match self.admit(&run_set).await {
                Admission::Started(job, token) => {
                    self.spawn_execution(&mut tasks, *job, token, permit, config);
                }
                Admission::Wait(retry_at) => {
                    drop(permit);
                    self.wait_for_change(&mut tasks, retry_at, &shutdown).await;
                }
                Admission::Drained => {
                    drop(permit);
                    if tasks.is_empty() {
                        break;
                    }
                    self.wait_for_change(&mut tasks, None, &shutdown).await;
                }
            }
        }

        if shutdown.is_cancelled() {
            let cancelled = self.cancels.cancel_all();
            if cancelled > 0 {
                info!(running = cancelled, "Run cancelled, stopping running jobs");
            }
        }
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        debug!("Scheduler finished");
    }

    /// Picks the best eligible run-set job and starts it.
    async fn admit(&self, run_set: &HashSet<String>) -> Admission {
        let now = Utc::now();
        let cancels = Arc::clone(&self.cancels);
        let admitted = self
            .state
            .transact(|ledger, events| {
                let mut earliest: Option<DateTime<Utc>> = None;
                let mut chosen: Option<String> = None;
                for job in ledger.pending().filter(|job| run_set.contains(&job.id)) {
                    if job.is_eligible(now) {
                        chosen = Some(job.id.clone());
                        break;
                    }
                    if let Some(at) = job.retry_after {
                        earliest = Some(earliest.map_or(at, |e| e.min(at)));
                    }
                }

                let Some(id) = chosen else {
                    let any_pending = ledger.pending().any(|job| run_set.contains(&job.id));
                    return Ok(if any_pending { Admission::Wait(earliest) } else { Admission::Drained });
                };

                let token = cancels.register(&id);
                let job = ledger.require_mut(&id)?;
                if let Err(e) = job.start(now) {
                    cancels.remove(&id);
                    return Err(e);
                }
                events.push(JobEvent::Started { job_id: id.clone(), attempt: job.retry_count + 1 });
                Ok(Admission::Started(Box::new(job.clone()), token))
            })
            .await;

        admitted.unwrap_or_else(|e| {
            error!(error = %e, "Admission failed");
            Admission::Wait(Some(now + chrono::Duration::milliseconds(100)))
        })
    }

    fn spawn_execution(
        &self,
        tasks: &mut JoinSet<()>,
        job: Job,
        token: CancellationToken,
        permit: OwnedSemaphorePermit,
        config: &SchedulerConfig,
    ) {
        let worker = Worker {
            state: Arc::clone(&self.state),
            generator: Arc::clone(&self.generator),
            progress: Arc::clone(&self.progress),
            cancels: Arc::clone(&self.cancels),
            retry: config.retry.clone(),
            timeout: job.parameters.timeout_secs.map(Duration::from_secs).or(config.job_timeout),
        };
        debug!(job_id = %job.id, priority = job.priority, attempt = job.retry_count + 1, "Job admitted");
        tasks.spawn(async move {
            // Slot is held until the outcome is recorded
            let _permit = permit;
            worker.execute(job, token).await;
        });
    }

    /// Waits for a running job to finish, for `retry_at`, or for shutdown.
    async fn wait_for_change(
        &self,
        tasks: &mut JoinSet<()>,
        retry_at: Option<DateTime<Utc>>,
        shutdown: &CancellationToken,
    ) {
        let backoff = retry_at.map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO));
        tokio::select! {
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
            () = sleep_opt(backoff) => {}
            () = shutdown.cancelled() => {}
        }
    }
}

async fn sleep_opt(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Worker task failed");
    }
}

/// Everything one execution needs, owned by its task.
struct Worker {
    state: Arc<LedgerState>,
    generator: Arc<dyn Generator>,
    progress: Arc<ProgressBoard>,
    cancels: Arc<CancelRegistry>,
    retry: RetryPolicy,
    timeout: Option<Duration>,
}

impl Worker {
    async fn execute(self, job: Job, token: CancellationToken) {
        let job_id = job.id.clone();
        self.progress.begin(&job_id);

        let outcome = self.call_generator(&job, &token).await;
        // A result that arrives after cancellation is discarded
        let outcome = if token.is_cancelled() { Err(GenerationError::Cancelled) } else { outcome };

        if let Err(e) = self.record(&job_id, outcome).await {
            error!(job_id = %job_id, error = %e, "Could not record job outcome");
        }
        self.cancels.remove(&job_id);
    }

    async fn call_generator(&self, job: &Job, token: &CancellationToken) -> Outcome {
        if let Err(e) = check_input_readable(&job.input_ref) {
            return Err(GenerationError::Permanent(e.to_string()));
        }

        let request = job.to_generation_request();
        let sink: Arc<dyn ProgressSink> = Arc::clone(&self.progress) as Arc<dyn ProgressSink>;
        let context = GenerationContext::new(job.id.clone(), token.clone(), sink);
        let call = self.generator.generate(&request, &context);

        tokio::select! {
            biased;
            () = token.cancelled() => Err(GenerationError::Cancelled),
            outcome = async {
                match self.timeout {
                    Some(limit) => tokio::time::timeout(limit, call)
                        .await
                        .unwrap_or(Err(GenerationError::Timeout(limit))),
                    None => call.await,
                }
            } => outcome,
        }
    }

    async fn record(&self, job_id: &str, outcome: Outcome) -> Result<(), BatchError> {
        let now = Utc::now();
        let retry = &self.retry;
        let progress = &self.progress;

        self.state
            .transact(|ledger, events| {
                let job = ledger.require_mut(job_id)?;
                if job.status != JobStatus::Processing {
                    warn!(job_id = %job_id, status = %job.status, "Job left processing while running");
                    return Ok(());
                }

                match outcome {
                    Ok(output) => {
                        job.complete(output, now)?;
                        progress.complete(job_id, "Completed");
                        info!(job_id = %job_id, backend = %job.backend, "Job completed");
                        events.push(JobEvent::Completed {
                            job_id: job_id.to_string(),
                            backend: job.backend.clone(),
                            cost: job.incurred_cost.unwrap_or(0.0),
                            duration_ms: job.duration().map(|d| d.num_milliseconds()),
                        });
                    }
                    Err(GenerationError::Cancelled) => {
                        job.cancel(CANCELLED_WHILE_RUNNING, now)?;
                        progress.fail(job_id, CANCELLED_WHILE_RUNNING);
                        info!(job_id = %job_id, "Job cancelled while running");
                        events.push(JobEvent::Cancelled {
                            job_id: job_id.to_string(),
                            reason: CANCELLED_WHILE_RUNNING.to_string(),
                        });
                    }
                    Err(error) => {
                        let message = error.to_string();
                        let decision = retry.on_failure(job, &error);
                        job.fail(message.clone(), now)?;
                        match decision {
                            RetryDecision::Retry { retry_count, after } => {
                                let delay = chrono::Duration::from_std(after)
                                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
                                job.requeue(now + delay)?;
                                progress.remove(job_id);
                                warn!(
                                    job_id = %job_id,
                                    retry_count,
                                    delay_ms = after.as_millis() as u64,
                                    error = %message,
                                    "Job failed, retry scheduled"
                                );
                                events.push(JobEvent::RetryScheduled {
                                    job_id: job_id.to_string(),
                                    retry_count,
                                    delay_ms: after.as_millis() as u64,
                                    error: message,
                                });
                            }
                            RetryDecision::GiveUp => {
                                progress.fail(job_id, &message);
                                error!(
                                    job_id = %job_id,
                                    retry_count = job.retry_count,
                                    error = %message,
                                    "Job failed"
                                );
                                events.push(JobEvent::Failed {
                                    job_id: job_id.to_string(),
                                    error: message,
                                    retry_count: job.retry_count,
                                });
                            }
                        }
                    }
                }
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_registry() {
        let registry = CancelRegistry::default();
        let token = registry.register("a");
        registry.register("b");
        assert_eq!(registry.len(), 2);

        assert!(registry.cancel("a"));
        assert!(token.is_cancelled());
        assert!(!registry.cancel("zzz"));

        registry.remove("a");
        assert_eq!(registry.cancel_all(), 1);
        assert!(!registry.is_empty());
    }

    #[tokio::test]
    async fn test_sleep_opt_none_never_fires() {
        let fired = tokio::time::timeout(Duration::from_millis(20), sleep_opt(None)).await;
        assert!(fired.is_err());
        sleep_opt(Some(Duration::from_millis(1))).await;
    }
}
