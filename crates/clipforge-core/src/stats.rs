//! Aggregate statistics, always derived from the ledger.

use crate::cost::{CostEstimator, CostSummary};
use crate::job::{Job, JobStatus, Ledger};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-job time assumed before any job has completed.
pub const DEFAULT_SECS_PER_JOB: f64 = 45.0;

/// Time estimate for the work still queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeEstimate {
    /// Jobs still pending or processing.
    pub remaining_jobs: usize,
    /// Seconds per job used for the estimate.
    pub secs_per_job: f64,
    /// One job at a time.
    pub sequential_secs: f64,
    /// Spread across the worker slots.
    pub concurrent_secs: f64,
}

/// Snapshot of the ledger by status, time and cost.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    /// Every job in the ledger.
    pub total: usize,
    /// Waiting for a slot.
    pub pending: usize,
    /// Running now.
    pub processing: usize,
    /// Finished successfully.
    pub completed: usize,
    /// Finished unsuccessfully.
    pub failed: usize,
    /// Removed by request.
    pub cancelled: usize,
    /// Retries consumed across all jobs.
    pub total_retries: u32,
    /// Completed over completed plus failed, in percent.
    pub success_rate: f64,
    /// Sum of finished attempt durations.
    pub total_duration_secs: f64,
    /// Mean duration of completed jobs.
    pub average_duration_secs: Option<f64>,
    /// Cost totals.
    pub costs: CostSummary,
}

impl AggregateStats {
    /// Computes stats over `jobs`.
    pub fn from_jobs<'a, I>(jobs: I) -> Self
    where
        I: IntoIterator<Item = &'a Job>,
        I::IntoIter: Clone,
    {
        let jobs = jobs.into_iter();
        let mut stats = AggregateStats { costs: CostEstimator::aggregate(jobs.clone()), ..Default::default() };
        let mut completed_secs = 0.0;

        for job in jobs {
            stats.total += 1;
            stats.total_retries += job.retry_count;
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
            if let Some(duration) = job.duration() {
                let secs = duration.num_milliseconds() as f64 / 1000.0;
                stats.total_duration_secs += secs;
                if job.status == JobStatus::Completed {
                    completed_secs += secs;
                }
            }
        }

        let finished = stats.completed + stats.failed;
        if finished > 0 {
            stats.success_rate = stats.completed as f64 / finished as f64 * 100.0;
        }
        if stats.completed > 0 {
            stats.average_duration_secs = Some(completed_secs / stats.completed as f64);
        }
        stats
    }

    /// Computes stats over the whole ledger.
    pub fn from_ledger(ledger: &Ledger) -> Self {
        Self::from_jobs(ledger.jobs())
    }

    /// Estimates how long the queued work will take with `concurrency` slots.
    pub fn estimate_remaining(&self, concurrency: usize) -> TimeEstimate {
        let remaining_jobs = self.pending + self.processing;
        let secs_per_job = self.average_duration_secs.unwrap_or(DEFAULT_SECS_PER_JOB);
        let sequential_secs = secs_per_job * remaining_jobs as f64;
        TimeEstimate {
            remaining_jobs,
            secs_per_job,
            sequential_secs,
            concurrent_secs: sequential_secs / concurrency.max(1) as f64,
        }
    }

    /// `average_duration_secs` as a [`Duration`].
    pub fn average_duration(&self) -> Option<Duration> {
        self.average_duration_secs.map(Duration::from_secs_f64)
    }
}
