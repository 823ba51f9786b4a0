//! Job lifecycle events.
//!
//! Every state transition produces one [`JobEvent`]. Events go to a broadcast
//! channel (for UIs that subscribe and may lag) and to registered
//! [`JobObserver`]s (synchronous callbacks that see every event in order).

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

/// Default broadcast buffer size.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something that happened to a job or a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// Job admitted to the ledger.
    Added {
        /// Job id
        job_id: String,
        /// Priority 1-5
        priority: u8,
        /// Target backend
        backend: String,
        /// Estimate in USD
        estimated_cost: f64,
    },
    /// Job handed to a worker.
    Started {
        /// Job id
        job_id: String,
        /// 1 for the first attempt
        attempt: u32,
    },
    /// Progress reported while running.
    Progress {
        /// Job id
        job_id: String,
        /// Current stage name
        stage: String,
        /// Overall fraction done
        fraction: f64,
        /// Latest message
        message: String,
        /// Estimated seconds remaining
        eta_secs: Option<f64>,
    },
    /// Job finished successfully.
    Completed {
        /// Job id
        job_id: String,
        /// Target backend
        backend: String,
        /// Incurred cost in USD
        cost: f64,
        /// Attempt wall time
        duration_ms: Option<i64>,
    },
    /// Attempt failed, another one is scheduled.
    RetryScheduled {
        /// Job id
        job_id: String,
        /// Retries consumed including this one
        retry_count: u32,
        /// Backoff before the job is eligible again
        delay_ms: u64,
        /// The failure
        error: String,
    },
    /// Job ended failed.
    Failed {
        /// Job id
        job_id: String,
        /// The failure
        error: String,
        /// Retries consumed
        retry_count: u32,
    },
    /// Job ended cancelled.
    Cancelled {
        /// Job id
        job_id: String,
        /// Why
        reason: String,
    },
    /// Job deleted from the ledger by a clear.
    Removed {
        /// Job id
        job_id: String,
    },
    /// A run began.
    RunStarted {
        /// Jobs in the run set
        jobs: usize,
        /// Worker slots
        concurrency: usize,
    },
    /// A run drained.
    RunFinished {
        /// Completed in this run
        completed: usize,
        /// Failed in this run
        failed: usize,
        /// Cancelled in this run
        cancelled: usize,
    },
    /// A ledger write failed even after a retry.
    PersistenceDegraded {
        /// The failure
        error: String,
    },
}

impl JobEvent {
    /// Job the event is about, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            JobEvent::Added { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::RetryScheduled { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id, .. }
            | JobEvent::Removed { job_id } => Some(job_id),
            JobEvent::RunStarted { .. }
            | JobEvent::RunFinished { .. }
            | JobEvent::PersistenceDegraded { .. } => None,
        }
    }
}

/// Callback hook invoked on every event.
///
/// Called synchronously while the ledger lock is held, so implementations
/// must not block or call back into the orchestrator.
pub trait JobObserver: Send + Sync {
    /// Handles one event.
    fn on_event(&self, event: &JobEvent);
}

impl<F> JobObserver for F
where
    F: Fn(&JobEvent) + Send + Sync,
{
    fn on_event(&self, event: &JobEvent) {
        self(event);
    }
}

/// Fan-out of job events.
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
    observers: RwLock<Vec<Arc<dyn JobObserver>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Creates a bus whose subscribers may lag by up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, observers: RwLock::new(Vec::new()) }
    }

    /// Subscribes to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Registers a callback.
    pub fn add_observer(&self, observer: Arc<dyn JobObserver>) {
        if let Ok(mut observers) = self.observers.write() {
            observers.push(observer);
        }
    }

    /// Publishes an event to subscribers and observers.
    pub fn emit(&self, event: JobEvent) {
        debug!(event = ?event, "Job event");
        if let Ok(observers) = self.observers.read() {
            for observer in observers.iter() {
                observer.on_event(&event);
            }
        }
        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish_non_exhaustive()
    }
}
