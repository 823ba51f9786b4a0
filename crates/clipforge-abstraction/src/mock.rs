//! Scriptable in-process generator.
//!
//! Used for dry runs and by the test suites of the other crates. Outcomes can
//! be scripted per job or globally; the generator records call order and the
//! highest number of simultaneous calls it observed.

use crate::{GenerationContext, GenerationError, GenerationOutput, GenerationRequest, Generator};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// What the mock does on one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    /// Return a successful output.
    Succeed,
    /// Fail with a transient error.
    Transient(String),
    /// Fail with a permanent error.
    Permanent(String),
    /// Never finish on its own; only cancellation ends the call.
    Hang,
}

impl FromStr for MockOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "succeed" | "success" | "ok" => Ok(Self::Succeed),
            "transient" => Ok(Self::Transient("simulated transient failure".to_string())),
            "permanent" => Ok(Self::Permanent("simulated permanent failure".to_string())),
            "hang" => Ok(Self::Hang),
            other => Err(format!("unknown mock outcome '{}'", other)),
        }
    }
}

/// Decrements the in-flight counter when a call ends, however it ends.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-process generator with scripted outcomes.
pub struct MockGenerator {
    latency: Duration,
    default_outcome: MockOutcome,
    actual_cost: Option<f64>,
    script: Mutex<VecDeque<MockOutcome>>,
    per_job: Mutex<HashMap<String, VecDeque<MockOutcome>>>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGenerator {
    /// A mock that succeeds immediately.
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            default_outcome: MockOutcome::Succeed,
            actual_cost: None,
            script: Mutex::new(VecDeque::new()),
            per_job: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// A mock whose every unscripted call ends with `outcome`.
    pub fn always(outcome: MockOutcome) -> Self {
        Self::new().with_default(outcome)
    }

    /// Sets how long each call takes.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Sets the outcome used once all scripts are exhausted.
    #[must_use]
    pub fn with_default(mut self, outcome: MockOutcome) -> Self {
        self.default_outcome = outcome;
        self
    }

    /// Makes successful calls report this actual cost.
    #[must_use]
    pub fn with_actual_cost(mut self, cost: f64) -> Self {
        self.actual_cost = Some(cost);
        self
    }

    /// Queues an outcome for the next unscripted call, whichever job it is.
    pub fn push_outcome(&self, outcome: MockOutcome) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
    }

    /// Queues outcomes for successive calls on one job.
    pub fn script_job(&self, job_id: &str, outcomes: impl IntoIterator<Item = MockOutcome>) {
        if let Ok(mut per_job) = self.per_job.lock() {
            per_job.entry(job_id.to_string()).or_default().extend(outcomes);
        }
    }

    /// Job ids in the order calls started.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of calls made for one job.
    pub fn attempts_for(&self, job_id: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|id| id.as_str() == job_id).count())
            .unwrap_or_default()
    }

    /// Highest number of simultaneous calls seen.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, job_id: &str) -> MockOutcome {
        if let Ok(mut per_job) = self.per_job.lock() {
            if let Some(outcome) = per_job.get_mut(job_id).and_then(VecDeque::pop_front) {
                return outcome;
            }
        }
        if let Ok(mut script) = self.script.lock() {
            if let Some(outcome) = script.pop_front() {
                return outcome;
            }
        }
        self.default_outcome.clone()
    }
}

#[async_trait]
impl Generator for MockGenerator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        context: &GenerationContext,
    ) -> Result<GenerationOutput, GenerationError> {
        let attempt = {
            let mut calls = self
                .calls
                .lock()
                .map_err(|_| GenerationError::permanent("mock call log poisoned"))?;
            calls.push(request.job_id.clone());
            calls.iter().filter(|id| **id == request.job_id).count()
        };

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let outcome = self.next_outcome(&request.job_id);
        context.report_stage("upload", "Uploading input");
        context.report_stage("generate", "Generating");

        if outcome == MockOutcome::Hang {
            context.cancel_token().cancelled().await;
            return Err(GenerationError::Cancelled);
        }

        tokio::select! {
            () = tokio::time::sleep(self.latency) => {}
            () = context.cancel_token().cancelled() => return Err(GenerationError::Cancelled),
        }

        match outcome {
            MockOutcome::Succeed => {
                context.report_fraction(1.0, "Generation finished");
                Ok(GenerationOutput {
                    payload: json!({
                        "generator": "mock",
                        "job_id": request.job_id,
                        "backend": request.backend,
                        "attempt": attempt,
                    }),
                    output_paths: Vec::new(),
                    actual_cost: self.actual_cost,
                })
            }
            MockOutcome::Transient(message) => Err(GenerationError::Transient(message)),
            MockOutcome::Permanent(message) => Err(GenerationError::Permanent(message)),
            MockOutcome::Hang => Err(GenerationError::Cancelled),
        }
    }
}
