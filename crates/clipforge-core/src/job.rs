//! Jobs, their state machine, and the ledger that holds them.

use crate::error::{BatchError, Result};
use chrono::{DateTime, Utc};
use clipforge_abstraction::{GenerationOutput, GenerationParameters, GenerationRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, error};

/// Lowest accepted priority.
pub const MIN_PRIORITY: u8 = 1;
/// Highest accepted priority.
pub const MAX_PRIORITY: u8 = 5;
/// Retry allowance given to new jobs unless configured otherwise.
pub const DEFAULT_MAX_RETRIES: u32 = 2;
/// Current ledger file format.
pub const LEDGER_VERSION: u32 = 1;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a worker slot.
    Pending,
    /// Owned by a worker.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully with no retry left.
    Failed,
    /// Removed by request.
    Cancelled,
}

impl JobStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Checks if a transition from this status to another is valid.
    ///
    /// `Failed -> Pending` only happens inside the same critical section as
    /// the failure that allowed a retry; a job found resting in `Failed` is
    /// terminal. `Processing -> Pending` is crash recovery.
    #[allow(clippy::match_same_arms)]
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        match (self, to) {
            (JobStatus::Pending, JobStatus::Processing | JobStatus::Cancelled) => true,
            (
                JobStatus::Processing,
                JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled,
            ) => true,
            (JobStatus::Processing, JobStatus::Pending) => true,
            (JobStatus::Failed, JobStatus::Pending) => true,
            _ => false,
        }
    }

    /// Completed, failed and cancelled jobs never move again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Lowercase name as written in the ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown job status '{}'", s))
    }
}

/// Caller-supplied description of a job, before admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Source asset.
    pub input_ref: PathBuf,
    /// Free-text instruction.
    pub instruction: String,
    /// Target backend/model.
    pub backend: String,
    /// Generation parameters.
    #[serde(default)]
    pub parameters: GenerationParameters,
    /// 1-5, 5 is most urgent.
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    3
}

impl JobRequest {
    /// Creates a request with default parameters and priority 3.
    pub fn new(
        input_ref: impl Into<PathBuf>,
        instruction: impl Into<String>,
        backend: impl Into<String>,
    ) -> Self {
        Self {
            input_ref: input_ref.into(),
            instruction: instruction.into(),
            backend: backend.into(),
            parameters: GenerationParameters::default(),
            priority: default_priority(),
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the generation parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: GenerationParameters) -> Self {
        self.parameters = parameters;
        self
    }
}

/// One unit of requested work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique, stable id.
    pub id: String,
    /// Admission order, breaks `created_at` ties.
    pub sequence: u64,
    /// Source asset.
    pub input_ref: PathBuf,
    /// Free-text instruction.
    pub instruction: String,
    /// Target backend/model.
    pub backend: String,
    /// Generation parameters.
    pub parameters: GenerationParameters,
    /// 1-5, 5 is most urgent.
    pub priority: u8,
    /// Current status.
    pub status: JobStatus,
    /// Admission time.
    pub created_at: DateTime<Utc>,
    /// When the current attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Retries consumed so far.
    pub retry_count: u32,
    /// Retry allowance, fixed at admission.
    pub max_retries: u32,
    /// Backoff gate; the job is not eligible before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
    /// Estimated cost in USD.
    pub estimated_cost: f64,
    /// Estimator warning, e.g. unknown backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_warning: Option<String>,
    /// Cost actually incurred, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incurred_cost: Option<f64>,
    /// Generator payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Files produced on success.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_paths: Vec<PathBuf>,
    /// Reason for failure or cancellation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Job {
    /// Creates a pending job from a validated request.
    ///
    /// # Arguments
    /// * `request` - The admitted request
    /// * `max_retries` - Retry allowance for this job
    /// * `estimated_cost` - Cost estimate in USD
    /// * `cost_warning` - Estimator warning, if any
    pub fn new(
        request: JobRequest,
        max_retries: u32,
        estimated_cost: f64,
        cost_warning: Option<String>,
    ) -> Self {
        Self {
            id: format!("job-{}", uuid::Uuid::new_v4()),
            sequence: 0,
            input_ref: request.input_ref,
            instruction: request.instruction,
            backend: request.backend,
            parameters: request.parameters,
            priority: request.priority,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            retry_after: None,
            estimated_cost,
            cost_warning,
            incurred_cost: None,
            result: None,
            output_paths: Vec::new(),
            error_message: None,
        }
    }

    fn transition(&mut self, to: JobStatus) -> Result<JobStatus> {
        let from = self.status;
        if !from.can_transition_to(to) {
            error!(job_id = %self.id, from = %from, to = %to, "Invalid job state transition");
            return Err(BatchError::InvalidTransition { job_id: self.id.clone(), from, to });
        }
        self.status = to;
        debug!(job_id = %self.id, from = %from, to = %to, "Job state transition");
        Ok(from)
    }

    /// Hands the job to a worker.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Processing)?;
        self.started_at = Some(now);
        self.retry_after = None;
        Ok(())
    }

    /// Records a successful generation.
    ///
    /// The incurred cost is the generator's reported cost, else the estimate.
    /// A null payload is stored as an empty object so the result survives a
    /// ledger reload.
    pub fn complete(&mut self, output: GenerationOutput, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Completed)?;
        self.completed_at = Some(now);
        self.incurred_cost = Some(output.actual_cost.unwrap_or(self.estimated_cost));
        self.result = Some(match output.payload {
            Value::Null => Value::Object(serde_json::Map::new()),
            payload => payload,
        });
        self.output_paths = output.output_paths;
        self.error_message = None;
        Ok(())
    }

    /// Records a failed attempt.
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.completed_at = Some(now);
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Puts a failed job back in the queue, consuming one retry.
    ///
    /// # Arguments
    /// * `retry_after` - Earliest instant the job may start again
    pub fn requeue(&mut self, retry_after: DateTime<Utc>) -> Result<()> {
        if self.retry_count >= self.max_retries {
            return Err(BatchError::RetriesExhausted {
                job_id: self.id.clone(),
                max_retries: self.max_retries,
            });
        }
        self.transition(JobStatus::Pending)?;
        self.retry_count += 1;
        self.retry_after = Some(retry_after);
        self.started_at = None;
        self.completed_at = None;
        self.error_message = None;
        Ok(())
    }

    /// Cancels a pending or processing job.
    pub fn cancel(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Cancelled)?;
        self.completed_at = Some(now);
        self.error_message = Some(reason.into());
        Ok(())
    }

    /// Returns an interrupted job to `pending`, as if it never started.
    pub fn reset_interrupted(&mut self) -> Result<()> {
        self.transition(JobStatus::Pending)?;
        self.started_at = None;
        Ok(())
    }

    /// Whether the job may start at `now` (pending and past its backoff gate).
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.retry_after.is_none_or(|at| at <= now)
    }

    /// Wall time of the last attempt, once it finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Queue order: priority desc, then created asc, then sequence asc.
    pub fn queue_order(&self, other: &Job) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }

    /// Builds the request handed to a generator.
    pub fn to_generation_request(&self) -> GenerationRequest {
        GenerationRequest {
            job_id: self.id.clone(),
            input_ref: self.input_ref.clone(),
            instruction: self.instruction.clone(),
            backend: self.backend.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// The full collection of jobs, kept in queue order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    /// File format version.
    pub version: u32,
    /// Next admission sequence number.
    pub next_sequence: u64,
    /// Last time the ledger was saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    /// Jobs, in queue order.
    jobs: Vec<Job>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self { version: LEDGER_VERSION, next_sequence: 0, last_updated: None, jobs: Vec::new() }
    }

    /// Inserts a job at its queue position and assigns its sequence number.
    ///
    /// # Returns
    /// The job id.
    pub fn insert(&mut self, mut job: Job) -> String {
        job.sequence = self.next_sequence;
        self.next_sequence += 1;
        let id = job.id.clone();
        let position = self.jobs.partition_point(|existing| existing.queue_order(&job).is_lt());
        self.jobs.insert(position, job);
        id
    }

    /// Looks up a job by id.
    pub fn get(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id == id)
    }

    /// Looks up a job by id for mutation.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|job| job.id == id)
    }

    /// Looks up a job by id, failing with `JobNotFound`.
    pub fn require_mut(&mut self, id: &str) -> Result<&mut Job> {
        self.get_mut(id).ok_or_else(|| BatchError::JobNotFound(id.to_string()))
    }

    /// All jobs in queue order.
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Number of jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the ledger holds no job.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Pending jobs in queue order.
    pub fn pending(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(|job| job.status == JobStatus::Pending)
    }

    /// Jobs in the given status.
    pub fn with_status(&self, status: JobStatus) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(move |job| job.status == status)
    }

    /// Count of jobs per status; every status is present.
    pub fn count_by_status(&self) -> BTreeMap<JobStatus, usize> {
        let mut counts: BTreeMap<JobStatus, usize> =
            JobStatus::ALL.into_iter().map(|status| (status, 0)).collect();
        for job in &self.jobs {
            *counts.entry(job.status).or_default() += 1;
        }
        counts
    }

    /// Removes jobs for which `keep` returns false.
    ///
    /// # Returns
    /// Number of jobs removed.
    pub fn retain(&mut self, keep: impl FnMut(&Job) -> bool) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(keep);
        before - self.jobs.len()
    }

    /// Resets jobs left in `processing` by a previous process to `pending`.
    ///
    /// # Returns
    /// Number of jobs recovered.
    pub fn recover_interrupted(&mut self) -> usize {
        let mut recovered = 0;
        for job in self.jobs.iter_mut().filter(|job| job.status == JobStatus::Processing) {
            if job.reset_interrupted().is_ok() {
                recovered += 1;
            }
        }
        recovered
    }

    /// Restores queue order after loading a hand-edited or older file.
    pub fn normalize(&mut self) {
        self.jobs.sort_by(Job::queue_order);
        if let Some(max) = self.jobs.iter().map(|job| job.sequence).max() {
            self.next_sequence = self.next_sequence.max(max + 1);
        }
    }
}
