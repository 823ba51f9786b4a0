//! Monthly budget tracking.
//!
//! Spending is recorded per completed job and persisted as JSON next to the
//! ledger. The current month rolls over automatically on the first spend of a
//! new month.

use crate::error::PersistenceError;
use crate::events::{JobEvent, JobObserver};
use crate::storage::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// History entries kept on disk.
pub const HISTORY_LIMIT: usize = 100;

/// One recorded spend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendingEntry {
    /// When it was recorded.
    pub timestamp: DateTime<Utc>,
    /// Backend charged.
    pub backend: String,
    /// USD.
    pub cost: f64,
    /// Free text, usually the job id.
    #[serde(default)]
    pub description: String,
    /// "YYYY-MM".
    pub month: String,
}

/// Persisted budget state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetData {
    /// Monthly limit in USD; 0 disables alerts.
    pub monthly_budget: f64,
    /// Spend in `last_reset` month.
    pub current_month_spending: f64,
    /// Spend since tracking began.
    pub total_spending: f64,
    /// Most recent entries, oldest first.
    pub spending_history: Vec<SpendingEntry>,
    /// Whether threshold alerts are logged.
    pub budget_alerts: bool,
    /// Month `current_month_spending` belongs to.
    pub last_reset: String,
}

impl BudgetData {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            monthly_budget: 0.0,
            current_month_spending: 0.0,
            total_spending: 0.0,
            spending_history: Vec::new(),
            budget_alerts: true,
            last_reset: month_key(now),
        }
    }
}

/// Threshold crossed by a spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetAlert {
    /// 75% used.
    Notice,
    /// 90% used.
    Warning,
    /// 100% used.
    Exceeded,
}

/// Coarse budget health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetHealth {
    /// At or above 100%.
    OverBudget,
    /// At or above 90%.
    Warning,
    /// At or above 75%.
    Caution,
    /// At or above 50%.
    OnTrack,
    /// Below 50%.
    WellUnder,
}

impl BudgetHealth {
    fn from_usage(percentage: f64) -> Self {
        match percentage {
            p if p >= 100.0 => Self::OverBudget,
            p if p >= 90.0 => Self::Warning,
            p if p >= 75.0 => Self::Caution,
            p if p >= 50.0 => Self::OnTrack,
            _ => Self::WellUnder,
        }
    }
}

impl fmt::Display for BudgetHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::OverBudget => "Over Budget",
            Self::Warning => "Budget Warning",
            Self::Caution => "Budget Caution",
            Self::OnTrack => "On Track",
            Self::WellUnder => "Well Under Budget",
        };
        f.write_str(label)
    }
}

/// Snapshot of the budget for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    /// "YYYY-MM".
    pub current_month: String,
    /// Monthly limit.
    pub monthly_budget: f64,
    /// Spend this month.
    pub current_spending: f64,
    /// Budget left, when a budget is set.
    pub remaining: Option<f64>,
    /// Percentage of the budget used.
    pub usage_percentage: f64,
    /// Spend since tracking began.
    pub lifetime_spending: f64,
    /// Spend this month per backend, largest first.
    pub by_backend: Vec<(String, f64)>,
    /// History entries this month.
    pub entries_this_month: usize,
    /// Coarse health.
    pub health: BudgetHealth,
}

fn month_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// Tracks spending against a monthly budget.
#[derive(Debug)]
pub struct BudgetTracker {
    path: Option<PathBuf>,
    data: Mutex<BudgetData>,
}

impl BudgetTracker {
    /// A tracker that never touches disk.
    pub fn in_memory() -> Self {
        Self { path: None, data: Mutex::new(BudgetData::fresh(Utc::now())) }
    }

    /// Loads the tracker from `path`.
    ///
    /// A missing or unreadable file starts a fresh budget.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let data = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Could not parse budget data");
                BudgetData::fresh(Utc::now())
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => BudgetData::fresh(Utc::now()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not load budget data");
                BudgetData::fresh(Utc::now())
            }
        };
        Self { path: Some(path), data: Mutex::new(data) }
    }

    /// Copy of the persisted state.
    pub fn data(&self) -> BudgetData {
        self.lock().clone()
    }

    /// Sets the monthly limit.
    pub fn set_monthly_budget(&self, amount: f64) -> Result<(), PersistenceError> {
        let mut data = self.lock();
        data.monthly_budget = amount.max(0.0);
        info!(budget = data.monthly_budget, "Monthly budget set");
        self.persist(&data)
    }

    /// Turns threshold alerts on or off.
    pub fn set_alerts(&self, enabled: bool) -> Result<(), PersistenceError> {
        let mut data = self.lock();
        data.budget_alerts = enabled;
        self.persist(&data)
    }

    /// Records a spend now.
    pub fn record_spending(
        &self,
        backend: &str,
        cost: f64,
        description: &str,
    ) -> Result<Option<BudgetAlert>, PersistenceError> {
        self.record_spending_at(backend, cost, description, Utc::now())
    }

    /// Records a spend at `now`.
    ///
    /// # Returns
    /// The highest threshold now crossed, if alerts are on and a budget is set.
    pub fn record_spending_at(
        &self,
        backend: &str,
        cost: f64,
        description: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BudgetAlert>, PersistenceError> {
        let mut data = self.lock();
        let month = month_key(now);
        if data.last_reset != month {
            debug!(from = %data.last_reset, to = %month, "Budget month rolled over");
            data.current_month_spending = 0.0;
            data.last_reset.clone_from(&month);
        }

        data.current_month_spending += cost;
        data.total_spending += cost;
        data.spending_history.push(SpendingEntry {
            timestamp: now,
            backend: backend.to_string(),
            cost,
            description: description.to_string(),
            month,
        });
        let overflow = data.spending_history.len().saturating_sub(HISTORY_LIMIT);
        data.spending_history.drain(..overflow);

        let alert = Self::check_alert(&data);
        self.persist(&data)?;
        Ok(alert)
    }

    fn check_alert(data: &BudgetData) -> Option<BudgetAlert> {
        if !data.budget_alerts || data.monthly_budget <= 0.0 {
            return None;
        }
        let usage = data.current_month_spending / data.monthly_budget * 100.0;
        let alert = match usage {
            u if u >= 100.0 => BudgetAlert::Exceeded,
            u if u >= 90.0 => BudgetAlert::Warning,
            u if u >= 75.0 => BudgetAlert::Notice,
            _ => return None,
        };
        warn!(
            alert = ?alert,
            spent = data.current_month_spending,
            budget = data.monthly_budget,
            "Budget threshold reached"
        );
        Some(alert)
    }

    /// Budget status for the current month.
    pub fn status(&self) -> BudgetStatus {
        self.status_at(Utc::now())
    }

    /// Budget status as seen at `now`.
    pub fn status_at(&self, now: DateTime<Utc>) -> BudgetStatus {
        let data = self.lock();
        let month = month_key(now);
        let current_spending =
            if data.last_reset == month { data.current_month_spending } else { 0.0 };

        let mut per_backend: BTreeMap<&str, f64> = BTreeMap::new();
        let mut entries_this_month = 0;
        for entry in data.spending_history.iter().filter(|e| e.month == month) {
            *per_backend.entry(entry.backend.as_str()).or_default() += entry.cost;
            entries_this_month += 1;
        }
        let mut by_backend: Vec<(String, f64)> =
            per_backend.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        by_backend.sort_by(|a, b| b.1.total_cmp(&a.1));

        let has_budget = data.monthly_budget > 0.0;
        let usage_percentage =
            if has_budget { current_spending / data.monthly_budget * 100.0 } else { 0.0 };

        BudgetStatus {
            current_month: month,
            monthly_budget: data.monthly_budget,
            current_spending,
            remaining: has_budget.then(|| (data.monthly_budget - current_spending).max(0.0)),
            usage_percentage,
            lifetime_spending: data.total_spending,
            by_backend,
            entries_this_month,
            health: BudgetHealth::from_usage(usage_percentage),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BudgetData> {
        self.data.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn persist(&self, data: &BudgetData) -> Result<(), PersistenceError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(data)?;
        write_atomic(path, json.as_bytes())
    }
}

impl JobObserver for BudgetTracker {
    fn on_event(&self, event: &JobEvent) {
        if let JobEvent::Completed { job_id, backend, cost, .. } = event {
            if *cost <= 0.0 {
                return;
            }
            if let Err(e) = self.record_spending(backend, *cost, job_id) {
                warn!(job_id = %job_id, error = %e, "Could not record spending");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_alert_thresholds() {
        let tracker = BudgetTracker::in_memory();
        tracker.set_monthly_budget(10.0).unwrap();
        let now = Utc::now();

        assert_eq!(tracker.record_spending_at("haiper_20", 5.0, "a", now).unwrap(), None);
        assert_eq!(
            tracker.record_spending_at("haiper_20", 2.5, "b", now).unwrap(),
            Some(BudgetAlert::Notice)
        );
        assert_eq!(
            tracker.record_spending_at("haiper_20", 1.5, "c", now).unwrap(),
            Some(BudgetAlert::Warning)
        );
        assert_eq!(
            tracker.record_spending_at("kling_21_pro", 1.0, "d", now).unwrap(),
            Some(BudgetAlert::Exceeded)
        );
        assert_eq!(tracker.status_at(now).health, BudgetHealth::OverBudget);
    }

    #[test]
    fn test_month_rollover() {
        let tracker = BudgetTracker::in_memory();
        tracker.record_spending_at("haiper_20", 3.0, "old", at(2025, 1, 20)).unwrap();
        tracker.record_spending_at("haiper_20", 1.0, "new", at(2025, 2, 2)).unwrap();

        let data = tracker.data();
        assert_eq!(data.last_reset, "2025-02");
        assert_eq!(data.current_month_spending, 1.0);
        assert_eq!(data.total_spending, 4.0);

        let status = tracker.status_at(at(2025, 2, 3));
        assert_eq!(status.entries_this_month, 1);
        assert_eq!(status.remaining, None);
        assert_eq!(status.health, BudgetHealth::WellUnder);

        assert_eq!(tracker.status_at(at(2025, 3, 1)).current_spending, 0.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let tracker = BudgetTracker::in_memory();
        for i in 0..(HISTORY_LIMIT + 20) {
            tracker.record_spending("haiper_20", 0.01, &format!("job-{}", i)).unwrap();
        }
        let data = tracker.data();
        assert_eq!(data.spending_history.len(), HISTORY_LIMIT);
        assert_eq!(data.spending_history[0].description, "job-20");
    }

    #[test]
    fn test_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("budget.json");
        let tracker = BudgetTracker::load(&path);
        tracker.set_monthly_budget(50.0).unwrap();
        tracker.record_spending("luma_dream", 0.9, "job-1").unwrap();

        let reloaded = BudgetTracker::load(&path);
        assert_eq!(reloaded.data(), tracker.data());
        let status = reloaded.status();
        assert_eq!(status.by_backend, vec![("luma_dream".to_string(), 0.9)]);
        assert!((status.remaining.unwrap() - 49.1).abs() < 1e-9);
    }

    #[test]
    fn test_observer_records_completed_jobs_only() {
        let tracker = BudgetTracker::in_memory();
        tracker.on_event(&JobEvent::Completed {
            job_id: "job-1".to_string(),
            backend: "haiper_20".to_string(),
            cost: 0.2,
            duration_ms: Some(1000),
        });
        tracker.on_event(&JobEvent::Failed {
            job_id: "job-2".to_string(),
            error: "boom".to_string(),
            retry_count: 2,
        });
        assert_eq!(tracker.data().spending_history.len(), 1);
        assert_eq!(tracker.data().total_spending, 0.2);
    }
}
