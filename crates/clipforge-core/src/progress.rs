//! Staged progress tracking with ETA.
//!
//! Each running job gets a [`ProgressTracker`] over a fixed, ordered stage
//! plan. Trackers only ever move forward. The [`ProgressBoard`] holds the
//! trackers of all jobs and is what generators report into.

use crate::events::{EventBus, JobEvent};
use clipforge_abstraction::ProgressSink;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Rejected progress update.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProgressError {
    /// No stage with this name in the plan.
    #[error("Unknown stage '{0}'")]
    UnknownStage(String),

    /// The stage lies before the current one.
    #[error("Cannot move back from stage '{from}' to '{to}'")]
    Backward {
        /// Current stage
        from: String,
        /// Requested stage
        to: String,
    },

    /// The tracker already completed or failed.
    #[error("Progress already finished")]
    Finished,
}

/// One entry of a stage plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stage name, unique within the plan.
    pub name: String,
    /// Human description.
    #[serde(default)]
    pub description: String,
    /// Typical duration, used for ETA only.
    pub estimated_secs: f64,
}

impl StageSpec {
    /// Creates a stage.
    pub fn new(name: &str, description: &str, estimated_secs: f64) -> Self {
        Self { name: name.to_string(), description: description.to_string(), estimated_secs }
    }
}

/// validate → upload → queue → generate → finalize.
pub fn default_stages() -> Vec<StageSpec> {
    vec![
        StageSpec::new("validate", "Validating input", 2.0),
        StageSpec::new("upload", "Uploading input", 5.0),
        StageSpec::new("queue", "Waiting in backend queue", 10.0),
        StageSpec::new("generate", "Generating", 30.0),
        StageSpec::new("finalize", "Downloading and finalizing", 8.0),
    ]
}

/// Maps a free-text backend status line to the stage it signals.
pub fn stage_hint(message: &str) -> Option<&'static str> {
    let message = message.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| message.contains(w));

    if has(&["complete", "finished", "download"]) {
        Some("finalize")
    } else if has(&["processing", "generating", "in progress"]) {
        Some("generate")
    } else if has(&["queue", "waiting"]) {
        Some("queue")
    } else if has(&["upload"]) {
        Some("upload")
    } else {
        None
    }
}

/// Status of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    /// Not reached yet.
    Pending,
    /// Current stage.
    Active,
    /// Passed.
    Completed,
    /// Failed while current.
    Failed,
}

/// Progress of one job.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    job_id: String,
    stages: Vec<StageSpec>,
    statuses: Vec<StageStatus>,
    current: usize,
    reported_fraction: f64,
    message: String,
    started: Instant,
    finished: bool,
}

impl ProgressTracker {
    /// Starts tracking `job_id` at the first stage of `stages`.
    pub fn new(job_id: impl Into<String>, stages: Vec<StageSpec>) -> Self {
        let stages = if stages.is_empty() { default_stages() } else { stages };
        let mut statuses = vec![StageStatus::Pending; stages.len()];
        statuses[0] = StageStatus::Active;
        Self {
            job_id: job_id.into(),
            stages,
            statuses,
            current: 0,
            reported_fraction: 0.0,
            message: String::new(),
            started: Instant::now(),
            finished: false,
        }
    }

    /// Name of the current stage.
    pub fn current_stage(&self) -> &str {
        &self.stages[self.current].name
    }

    /// Status of every stage, in plan order.
    pub fn stage_statuses(&self) -> Vec<(String, StageStatus)> {
        self.stages.iter().map(|s| s.name.clone()).zip(self.statuses.iter().copied()).collect()
    }

    fn ensure_running(&self) -> Result<(), ProgressError> {
        if self.finished { Err(ProgressError::Finished) } else { Ok(()) }
    }

    /// Moves to `stage`, completing every stage in between.
    ///
    /// Advancing to the current stage only updates the message.
    pub fn advance_to(&mut self, stage: &str, message: &str) -> Result<(), ProgressError> {
        self.ensure_running()?;
        let target = self
            .stages
            .iter()
            .position(|s| s.name == stage)
            .ok_or_else(|| ProgressError::UnknownStage(stage.to_string()))?;

        if target < self.current {
            return Err(ProgressError::Backward {
                from: self.current_stage().to_string(),
                to: stage.to_string(),
            });
        }

        for status in &mut self.statuses[self.current..target] {
            *status = StageStatus::Completed;
        }
        self.statuses[target] = StageStatus::Active;
        self.current = target;
        if !message.is_empty() {
            self.message = message.to_string();
        }
        Ok(())
    }

    /// Records overall progress; values are clamped to `0.0..=1.0`.
    pub fn update_fraction(&mut self, fraction: f64, message: &str) -> Result<(), ProgressError> {
        self.ensure_running()?;
        self.reported_fraction = fraction.clamp(0.0, 1.0);
        if !message.is_empty() {
            self.message = message.to_string();
        }
        Ok(())
    }

    /// Applies a backend status line, advancing when it names a later stage.
    pub fn apply_log(&mut self, message: &str) -> Result<(), ProgressError> {
        self.ensure_running()?;
        if let Some(stage) = stage_hint(message) {
            let ahead = self
                .stages
                .iter()
                .position(|s| s.name == stage)
                .is_some_and(|index| index > self.current);
            if ahead {
                return self.advance_to(stage, message);
            }
        }
        self.message = message.to_string();
        Ok(())
    }

    /// Marks every stage completed.
    pub fn complete(&mut self, message: &str) -> Result<(), ProgressError> {
        self.ensure_running()?;
        self.statuses.fill(StageStatus::Completed);
        self.current = self.stages.len() - 1;
        self.reported_fraction = 1.0;
        self.message = message.to_string();
        self.finished = true;
        Ok(())
    }

    /// Marks the current stage failed.
    pub fn fail(&mut self, message: &str) -> Result<(), ProgressError> {
        self.ensure_running()?;
        self.statuses[self.current] = StageStatus::Failed;
        self.message = message.to_string();
        self.finished = true;
        Ok(())
    }

    /// Fraction done: the reported fraction, or the share of estimated time
    /// in completed stages when that is larger.
    pub fn fraction_done(&self) -> f64 {
        let total: f64 = self.stages.iter().map(|s| s.estimated_secs).sum();
        let passed: f64 = self.stages[..self.current].iter().map(|s| s.estimated_secs).sum();
        let by_stage = if total > 0.0 { passed / total } else { 0.0 };
        self.reported_fraction.max(by_stage).min(1.0)
    }

    /// ETA for a given elapsed time.
    ///
    /// `elapsed / fraction - elapsed` once some progress is known, else the
    /// current stage's estimate.
    pub fn eta_with_elapsed(&self, elapsed: Duration) -> Duration {
        if self.finished {
            return Duration::ZERO;
        }
        let fraction = self.fraction_done();
        if fraction > 0.0 {
            let elapsed = elapsed.as_secs_f64();
            Duration::from_secs_f64((elapsed / fraction - elapsed).max(0.0))
        } else {
            Duration::from_secs_f64(self.stages[self.current].estimated_secs.max(0.0))
        }
    }

    /// ETA from wall time since tracking began.
    pub fn eta(&self) -> Duration {
        self.eta_with_elapsed(self.started.elapsed())
    }

    /// Static estimate of the current and all later stages.
    pub fn remaining_estimate(&self) -> Duration {
        if self.finished {
            return Duration::ZERO;
        }
        let secs: f64 = self.stages[self.current..].iter().map(|s| s.estimated_secs).sum();
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Serializable view of the tracker.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let stage = &self.stages[self.current];
        ProgressSnapshot {
            job_id: self.job_id.clone(),
            stage: stage.name.clone(),
            stage_description: stage.description.clone(),
            stage_index: self.current,
            stage_count: self.stages.len(),
            fraction: self.fraction_done(),
            message: self.message.clone(),
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            eta_secs: self.eta().as_secs_f64(),
            stages: self.stage_statuses(),
            finished: self.finished,
        }
    }
}

/// Point-in-time progress of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Job id.
    pub job_id: String,
    /// Current stage name.
    pub stage: String,
    /// Current stage description.
    pub stage_description: String,
    /// 0-based index of the current stage.
    pub stage_index: usize,
    /// Stages in the plan.
    pub stage_count: usize,
    /// Overall fraction done.
    pub fraction: f64,
    /// Latest message.
    pub message: String,
    /// Seconds since tracking began.
    pub elapsed_secs: f64,
    /// Estimated seconds left.
    pub eta_secs: f64,
    /// Every stage with its status.
    pub stages: Vec<(String, StageStatus)>,
    /// Completed or failed.
    pub finished: bool,
}

/// Finished trackers a board keeps by default.
pub const FINISHED_TRACKER_LIMIT: usize = 256;

#[derive(Default)]
struct Trackers {
    by_job: HashMap<String, ProgressTracker>,
    /// Finished jobs, oldest first.
    finished: VecDeque<String>,
}

impl Trackers {
    fn forget_finished(&mut self, job_id: &str) {
        self.finished.retain(|id| id != job_id);
    }
}

/// Progress trackers for every job, fed by generators.
///
/// Trackers of finished jobs stay queryable until more than the finished
/// limit have accumulated; then the oldest are evicted.
pub struct ProgressBoard {
    stages: Vec<StageSpec>,
    trackers: Mutex<Trackers>,
    finished_limit: usize,
    events: Option<Arc<EventBus>>,
}

impl ProgressBoard {
    /// Creates a board using `stages` for every job.
    pub fn new(stages: Vec<StageSpec>) -> Self {
        Self {
            stages,
            trackers: Mutex::new(Trackers::default()),
            finished_limit: FINISHED_TRACKER_LIMIT,
            events: None,
        }
    }

    /// Publishes every update as [`JobEvent::Progress`] on `events`.
    #[must_use]
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Keeps at most `limit` finished trackers.
    #[must_use]
    pub fn with_finished_limit(mut self, limit: usize) -> Self {
        self.finished_limit = limit;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Trackers> {
        self.trackers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a fresh tracker for an attempt of `job_id`.
    pub fn begin(&self, job_id: &str) {
        let tracker = ProgressTracker::new(job_id, self.stages.clone());
        let snapshot = tracker.snapshot();
        {
            let mut trackers = self.lock();
            trackers.forget_finished(job_id);
            trackers.by_job.insert(job_id.to_string(), tracker);
        }
        self.publish(snapshot);
    }

    /// Current progress of `job_id`.
    pub fn snapshot(&self, job_id: &str) -> Option<ProgressSnapshot> {
        self.lock().by_job.get(job_id).map(ProgressTracker::snapshot)
    }

    /// Number of trackers held, running and finished.
    pub fn len(&self) -> usize {
        self.lock().by_job.len()
    }

    /// Whether no tracker is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks `job_id` completed.
    pub fn complete(&self, job_id: &str, message: &str) {
        self.update(job_id, |t| t.complete(message));
    }

    /// Marks `job_id` failed.
    pub fn fail(&self, job_id: &str, message: &str) {
        self.update(job_id, |t| t.fail(message));
    }

    /// Forgets `job_id`.
    pub fn remove(&self, job_id: &str) {
        let mut trackers = self.lock();
        trackers.by_job.remove(job_id);
        trackers.forget_finished(job_id);
    }

    fn update(
        &self,
        job_id: &str,
        apply: impl FnOnce(&mut ProgressTracker) -> Result<(), ProgressError>,
    ) {
        let snapshot = {
            let mut trackers = self.lock();
            let Some(tracker) = trackers.by_job.get_mut(job_id) else {
                debug!(job_id = %job_id, "Progress for untracked job ignored");
                return;
            };
            let was_finished = tracker.snapshot().finished;
            if let Err(e) = apply(tracker) {
                debug!(job_id = %job_id, error = %e, "Progress update rejected");
                return;
            }
            let snapshot = tracker.snapshot();
            if snapshot.finished && !was_finished {
                trackers.finished.push_back(job_id.to_string());
                while trackers.finished.len() > self.finished_limit {
                    if let Some(oldest) = trackers.finished.pop_front() {
                        trackers.by_job.remove(&oldest);
                    }
                }
            }
            snapshot
        };
        self.publish(snapshot);
    }

    fn publish(&self, snapshot: ProgressSnapshot) {
        if let Some(events) = &self.events {
            events.emit(JobEvent::Progress {
                job_id: snapshot.job_id,
                stage: snapshot.stage,
                fraction: snapshot.fraction,
                message: snapshot.message,
                eta_secs: Some(snapshot.eta_secs),
            });
        }
    }
}

impl Default for ProgressBoard {
    fn default() -> Self {
        Self::new(default_stages())
    }
}

impl ProgressSink for ProgressBoard {
    fn stage(&self, job_id: &str, stage: &str, message: &str) {
        self.update(job_id, |t| t.advance_to(stage, message));
    }

    fn fraction(&self, job_id: &str, fraction: f64, message: &str) {
        self.update(job_id, |t| t.update_fraction(fraction, message));
    }

    fn log(&self, job_id: &str, message: &str) {
        self.update(job_id, |t| t.apply_log(message));
    }
}

impl std::fmt::Debug for ProgressBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressBoard").field("stages", &self.stages.len()).finish_non_exhaustive()
    }
}

/// Formats a duration as "Xm Ys" or "Ys".
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let minutes = total_secs / 60;
    let seconds = total_secs % 60;

    if minutes > 0 { format!("{}m {}s", minutes, seconds) } else { format!("{}s", seconds) }
}
