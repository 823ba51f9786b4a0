//! Summary of one run.

use clipforge_core::{AggregateStats, BackendCost, Job, JobStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A job of the run that ended failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Job id
    pub job_id: String,
    /// Source asset
    pub input_ref: PathBuf,
    /// Last error
    pub error: String,
    /// Retries consumed
    pub retry_count: u32,
}

/// Outcome of [`crate::BatchOrchestrator::run`], limited to the jobs that
/// were pending when the run started.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Jobs in the run set
    pub total: usize,
    /// Ended completed
    pub completed: usize,
    /// Ended failed
    pub failed: usize,
    /// Ended cancelled
    pub cancelled: usize,
    /// Still pending, e.g. after the run was cancelled
    pub pending: usize,
    /// Completed over completed plus failed, in percent
    pub success_rate: f64,
    /// Retries consumed by the run set
    pub total_retries: u32,
    /// Wall time of the run
    pub elapsed_secs: f64,
    /// Mean duration of completed jobs
    pub average_job_secs: Option<f64>,
    /// Sum of estimates
    pub estimated_cost: f64,
    /// Sum of incurred costs
    pub incurred_cost: f64,
    /// Estimates of failed jobs
    pub failed_cost_lost: f64,
    /// Per-backend costs
    pub by_backend: BTreeMap<String, BackendCost>,
    /// Failed jobs with their last error
    pub failures: Vec<JobFailure>,
    /// Cost warnings attached to run jobs
    pub warnings: Vec<String>,
    /// False when a ledger write failed during the run
    pub durably_recorded: bool,
}

impl BatchReport {
    /// Report of a run that had nothing to do.
    pub fn empty() -> Self {
        Self { durably_recorded: true, ..Default::default() }
    }

    /// Builds a report from the final state of the run set.
    ///
    /// # Arguments
    /// * `jobs` - Run-set jobs as they are after the run
    /// * `elapsed_secs` - Wall time of the run
    /// * `durably_recorded` - Whether every ledger write succeeded
    pub fn from_jobs(jobs: &[Job], elapsed_secs: f64, durably_recorded: bool) -> Self {
        let stats = AggregateStats::from_jobs(jobs);
        let failures = jobs
            .iter()
            .filter(|job| job.status == JobStatus::Failed)
            .map(|job| JobFailure {
                job_id: job.id.clone(),
                input_ref: job.input_ref.clone(),
                error: job.error_message.clone().unwrap_or_default(),
                retry_count: job.retry_count,
            })
            .collect();
        let warnings = jobs
            .iter()
            .filter_map(|job| job.cost_warning.as_ref().map(|w| format!("{}: {}", job.id, w)))
            .collect();

        Self {
            total: stats.total,
            completed: stats.completed,
            failed: stats.failed,
            cancelled: stats.cancelled,
            pending: stats.pending + stats.processing,
            success_rate: stats.success_rate,
            total_retries: stats.total_retries,
            elapsed_secs,
            average_job_secs: stats.average_duration_secs,
            estimated_cost: stats.costs.estimated_total,
            incurred_cost: stats.costs.incurred_total,
            failed_cost_lost: stats.costs.failed_cost_lost,
            by_backend: stats.costs.by_backend,
            failures,
            warnings,
            durably_recorded,
        }
    }

    /// Whether the run had no jobs.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Process exit code: 1 if any job ended failed, else 0.
    pub fn exit_code(&self) -> i32 {
        i32::from(self.failed > 0)
    }
}
