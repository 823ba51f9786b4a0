//! Cost estimation for single jobs, batches, and whole ledgers.

use super::pricing::{ModelPricing, PricingTable, Quality};
use crate::job::{Job, JobStatus};
use clipforge_abstraction::GenerationParameters;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::warn;

/// Clip length assumed when a job does not set one.
pub const DEFAULT_DURATION_SECS: u32 = 5;

/// Estimate for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Backend priced.
    pub backend: String,
    /// USD.
    pub amount: f64,
    /// Seconds actually billed, after capping.
    pub duration_secs: u32,
    /// Whether the backend was in the pricing table.
    pub known: bool,
    /// Set for unknown backends and capped durations.
    pub warning: Option<String>,
}

/// Estimate for many files on one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCostEstimate {
    /// Estimate for a single file.
    pub per_file: CostEstimate,
    /// Number of files.
    pub file_count: usize,
    /// Cost before discount.
    pub subtotal: f64,
    /// Discount applied, as a fraction.
    pub discount_rate: f64,
    /// Discount in USD.
    pub discount_amount: f64,
    /// Cost after discount.
    pub total: f64,
}

/// One row of a model comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelComparison {
    /// Backend id.
    pub backend: String,
    /// Display name.
    pub name: String,
    /// Marketing tier.
    pub tier: String,
    /// Output quality class.
    pub quality: Quality,
    /// Value-for-money score.
    pub efficiency_score: f64,
    /// Billed seconds.
    pub duration_secs: u32,
    /// USD for one clip.
    pub total_cost: f64,
    /// USD per quality point.
    pub cost_per_quality: f64,
    /// 1 is cheapest.
    pub rank: usize,
}

/// How recommendations are ranked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreference {
    /// Cheapest first.
    Budget,
    /// Best efficiency score first.
    #[default]
    Balanced,
    /// Best quality first, cheaper wins ties.
    Premium,
}

impl FromStr for QualityPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "budget" => Ok(Self::Budget),
            "balanced" => Ok(Self::Balanced),
            "premium" => Ok(Self::Premium),
            other => Err(format!("unknown quality preference '{}'", other)),
        }
    }
}

/// Spend projection for a steady daily volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyProjection {
    /// USD per day.
    pub daily: f64,
    /// USD per week.
    pub weekly: f64,
    /// USD per 30-day month.
    pub monthly: f64,
}

/// Cost totals for one backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendCost {
    /// Jobs targeting this backend.
    pub jobs: usize,
    /// Completed jobs.
    pub completed: usize,
    /// Sum of estimates.
    pub estimated: f64,
    /// Sum of incurred costs.
    pub incurred: f64,
}

/// Cost totals over a set of jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    /// Sum of estimates over every job.
    pub estimated_total: f64,
    /// Sum of incurred costs (completed jobs).
    pub incurred_total: f64,
    /// Estimates of jobs that ended failed.
    pub failed_cost_lost: f64,
    /// Per-backend breakdown.
    pub by_backend: BTreeMap<String, BackendCost>,
}

/// Prices jobs from a [`PricingTable`].
///
/// Never fails: an unknown backend is priced at zero and flagged.
#[derive(Debug, Clone, Default)]
pub struct CostEstimator {
    table: PricingTable,
}

impl CostEstimator {
    /// Creates an estimator over `table`.
    pub fn new(table: PricingTable) -> Self {
        Self { table }
    }

    /// The pricing table in use.
    pub fn table(&self) -> &PricingTable {
        &self.table
    }

    /// Estimates one job.
    ///
    /// # Arguments
    /// * `backend` - Backend id
    /// * `parameters` - Job parameters; only `duration_secs` is priced
    pub fn estimate(&self, backend: &str, parameters: &GenerationParameters) -> CostEstimate {
        let requested = parameters.duration_secs.unwrap_or(DEFAULT_DURATION_SECS);
        let Some(pricing) = self.table.get(backend) else {
            warn!(backend = %backend, "Unknown backend, cost assumed zero");
            return CostEstimate {
                backend: backend.to_string(),
                amount: 0.0,
                duration_secs: requested,
                known: false,
                warning: Some(format!("Unknown backend '{}', cost assumed zero", backend)),
            };
        };

        let duration_secs = requested.min(pricing.max_duration_secs);
        let warning = (requested > pricing.max_duration_secs).then(|| {
            format!("Duration capped at {}s (model limit)", pricing.max_duration_secs)
        });

        CostEstimate {
            backend: backend.to_string(),
            amount: pricing.cost_per_second * f64::from(duration_secs),
            duration_secs,
            known: true,
            warning,
        }
    }

    /// Estimates `file_count` jobs on one backend with volume discounts.
    ///
    /// 2% off from 5 files, 5% off from 10.
    pub fn estimate_batch(
        &self,
        backend: &str,
        file_count: usize,
        parameters: &GenerationParameters,
    ) -> BatchCostEstimate {
        let per_file = self.estimate(backend, parameters);
        let subtotal = per_file.amount * file_count as f64;
        let discount_rate = match file_count {
            n if n >= 10 => 0.05,
            n if n >= 5 => 0.02,
            _ => 0.0,
        };
        let discount_amount = subtotal * discount_rate;

        BatchCostEstimate {
            per_file,
            file_count,
            subtotal,
            discount_rate,
            discount_amount,
            total: subtotal - discount_amount,
        }
    }

    /// Every known backend priced for one clip, cheapest first.
    pub fn compare(&self, duration_secs: u32) -> Vec<ModelComparison> {
        let parameters =
            GenerationParameters { duration_secs: Some(duration_secs), ..Default::default() };

        let mut rows: Vec<ModelComparison> = self
            .table
            .iter()
            .map(|(backend, pricing)| {
                let estimate = self.estimate(backend, &parameters);
                comparison_row(backend, pricing, &estimate)
            })
            .collect();

        rows.sort_by(|a, b| a.total_cost.total_cmp(&b.total_cost));
        for (index, row) in rows.iter_mut().enumerate() {
            row.rank = index + 1;
        }
        rows
    }

    /// Top three backends for a preference, optionally within a per-clip budget.
    pub fn recommend(
        &self,
        duration_secs: u32,
        budget_limit: Option<f64>,
        preference: QualityPreference,
    ) -> Vec<ModelComparison> {
        let mut rows: Vec<ModelComparison> = self
            .compare(duration_secs)
            .into_iter()
            .filter(|row| budget_limit.is_none_or(|limit| row.total_cost <= limit))
            .collect();

        match preference {
            QualityPreference::Budget => {}
            QualityPreference::Balanced => {
                rows.sort_by(|a, b| b.efficiency_score.total_cmp(&a.efficiency_score));
            }
            QualityPreference::Premium => rows.sort_by(|a, b| {
                b.quality.cmp(&a.quality).then_with(|| a.total_cost.total_cmp(&b.total_cost))
            }),
        }
        rows.truncate(3);
        rows
    }

    /// Projects spend for `per_day` clips a day.
    pub fn project_monthly(
        &self,
        backend: &str,
        per_day: u32,
        parameters: &GenerationParameters,
    ) -> MonthlyProjection {
        let daily = self.estimate(backend, parameters).amount * f64::from(per_day);
        MonthlyProjection { daily, weekly: daily * 7.0, monthly: daily * 30.0 }
    }

    /// Sums estimated and incurred costs over `jobs`.
    pub fn aggregate<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> CostSummary {
        let mut summary = CostSummary::default();
        for job in jobs {
            let incurred = job.incurred_cost.unwrap_or(0.0);
            summary.estimated_total += job.estimated_cost;
            summary.incurred_total += incurred;
            if job.status == JobStatus::Failed {
                summary.failed_cost_lost += job.estimated_cost;
            }

            let entry = summary.by_backend.entry(job.backend.clone()).or_default();
            entry.jobs += 1;
            entry.estimated += job.estimated_cost;
            entry.incurred += incurred;
            if job.status == JobStatus::Completed {
                entry.completed += 1;
            }
        }
        summary
    }
}

fn comparison_row(backend: &str, pricing: &ModelPricing, estimate: &CostEstimate) -> ModelComparison {
    ModelComparison {
        backend: backend.to_string(),
        name: pricing.name.clone(),
        tier: pricing.tier.clone(),
        quality: pricing.quality,
        efficiency_score: pricing.efficiency_score,
        duration_secs: estimate.duration_secs,
        total_cost: estimate.amount,
        cost_per_quality: estimate.amount / pricing.quality.score(),
        rank: 0,
    }
}
