//! `pricing` command: backend prices, recommendations and batch estimates.

use super::print_json;
use crate::colors::{money, money_fine, primary_cell};
use crate::config::CliOptions;
use clap::Subcommand;
use clipforge_abstraction::GenerationParameters;
use clipforge_core::{BatchConfig, CostEstimator, ModelComparison, QualityPreference};
use colored::Colorize;
use comfy_table::{Cell, Table};

/// Pricing subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum PricingCommand {
    /// Every backend priced for one clip, cheapest first
    Compare {
        /// Clip length in seconds
        #[arg(long, default_value = "5")]
        duration: u32,
    },
    /// Best three backends for a preference
    Recommend {
        /// Clip length in seconds
        #[arg(long, default_value = "5")]
        duration: u32,

        /// Maximum USD per clip
        #[arg(long)]
        budget_limit: Option<f64>,

        /// budget, balanced or premium
        #[arg(long, default_value = "balanced")]
        preference: QualityPreference,
    },
    /// Cost of a batch on one backend, with volume discounts
    Estimate {
        /// Backend model
        #[arg(short, long, default_value = "kling_21_standard")]
        backend: String,

        /// Number of clips
        #[arg(long, default_value = "1")]
        count: usize,

        /// Clip length in seconds
        #[arg(long, default_value = "5")]
        duration: u32,
    },
    /// Daily, weekly and monthly spend for a steady volume
    Project {
        /// Backend model
        #[arg(short, long, default_value = "kling_21_standard")]
        backend: String,

        /// Clips per day
        #[arg(long)]
        per_day: u32,

        /// Clip length in seconds
        #[arg(long, default_value = "5")]
        duration: u32,
    },
}

/// Execute a pricing subcommand.
pub fn execute(options: &CliOptions, config: &BatchConfig, command: PricingCommand) -> anyhow::Result<i32> {
    let estimator = CostEstimator::new(config.pricing_table());

    match command {
        PricingCommand::Compare { duration } => {
            let rows = estimator.compare(duration);
            if options.json {
                print_json(&rows)?;
            } else {
                println!("{}", format!("Backend prices for a {}s clip", duration).bold().cyan());
                print_comparison(&rows);
            }
        }
        PricingCommand::Recommend { duration, budget_limit, preference } => {
            let rows = estimator.recommend(duration, budget_limit, preference);
            if options.json {
                print_json(&rows)?;
            } else if rows.is_empty() {
                println!("  {} No backend fits that budget", "•".dimmed());
            } else {
                println!("{}", "Recommended backends".bold().cyan());
                print_comparison(&rows);
            }
        }
        PricingCommand::Estimate { backend, count, duration } => {
            let estimate = estimator.estimate_batch(&backend, count, &with_duration(duration));
            if options.json {
                print_json(&estimate)?;
                return Ok(0);
            }
            println!("{}", format!("Estimate for {} clip(s) on {}", count, backend).bold().cyan());
            println!("  Per clip:  {} ({}s)", money_fine(estimate.per_file.amount), estimate.per_file.duration_secs);
            println!("  Subtotal:  {}", money(estimate.subtotal));
            if estimate.discount_amount > 0.0 {
                println!(
                    "  Discount:  -{} ({:.0}%)",
                    money(estimate.discount_amount),
                    estimate.discount_rate * 100.0
                );
            }
            println!("  Total:     {}", money(estimate.total).bold());
            if let Some(warning) = &estimate.per_file.warning {
                println!("  {} {}", "!".yellow(), warning.yellow());
            }
        }
        PricingCommand::Project { backend, per_day, duration } => {
            let projection = estimator.project_monthly(&backend, per_day, &with_duration(duration));
            if options.json {
                print_json(&projection)?;
                return Ok(0);
            }
            println!("{}", format!("{} clip(s)/day on {}", per_day, backend).bold().cyan());
            println!("  Daily:   {}", money(projection.daily));
            println!("  Weekly:  {}", money(projection.weekly));
            println!("  Monthly: {}", money(projection.monthly).bold());
        }
    }
    Ok(0)
}

fn with_duration(duration: u32) -> GenerationParameters {
    GenerationParameters { duration_secs: Some(duration), ..Default::default() }
}

fn print_comparison(rows: &[ModelComparison]) {
    let mut table = Table::new();
    table.set_header(vec!["#", "Backend", "Name", "Tier", "Quality", "Seconds", "Cost", "$/Quality"]);
    for row in rows {
        table.add_row(vec![
            Cell::new(row.rank),
            primary_cell(&row.backend),
            Cell::new(&row.name),
            Cell::new(&row.tier),
            Cell::new(row.quality),
            Cell::new(row.duration_secs),
            Cell::new(money_fine(row.total_cost)),
            Cell::new(format!("{:.4}", row.cost_per_quality)),
        ]);
    }
    println!("{}", table);
}
