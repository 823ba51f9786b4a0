//! `budget` command: monthly spending limit and alerts.

use super::print_json;
use crate::colors::{health_label, money, primary_cell};
use crate::config::{CliOptions, budget_tracker};
use anyhow::{Context, bail};
use clap::{Subcommand, ValueEnum};
use clipforge_core::BatchConfig;
use colored::Colorize;
use comfy_table::{Cell, Table};

/// Alert switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    /// Alerts enabled
    On,
    /// Alerts disabled
    Off,
}

/// Budget subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum BudgetCommand {
    /// Show spending against the monthly budget
    Show,
    /// Set the monthly budget
    Set {
        /// Budget amount in USD (0 disables the budget)
        amount: f64,
    },
    /// Turn threshold alerts on or off
    Alerts {
        /// on or off
        state: Toggle,
    },
}

/// Execute a budget subcommand.
pub fn execute(options: &CliOptions, config: &BatchConfig, command: BudgetCommand) -> anyhow::Result<i32> {
    let tracker = budget_tracker(options, config);

    match command {
        BudgetCommand::Show => {
            let status = tracker.status();
            if options.json {
                print_json(&status)?;
                return Ok(0);
            }
            println!("{}", format!("Budget for {}", status.current_month).bold().cyan());
            println!();
            if status.monthly_budget > 0.0 {
                println!("  Budget:    {}", money(status.monthly_budget));
                println!("  Spent:     {} ({:.1}%)", money(status.current_spending), status.usage_percentage);
                if let Some(remaining) = status.remaining {
                    println!("  Remaining: {}", money(remaining));
                }
                println!("  Health:    {}", health_label(status.health));
            } else {
                println!("  Spent:     {}", money(status.current_spending));
                println!("  {}", "No monthly budget set. Use 'clipforge budget set <amount>'.".yellow());
            }
            println!("  Lifetime:  {}", money(status.lifetime_spending));

            if !status.by_backend.is_empty() {
                println!();
                let mut table = Table::new();
                table.set_header(vec!["Backend", "Spent"]);
                for (backend, spent) in &status.by_backend {
                    table.add_row(vec![primary_cell(backend), Cell::new(money(*spent))]);
                }
                println!("{}", table);
            }
        }
        BudgetCommand::Set { amount } => {
            if !amount.is_finite() || amount < 0.0 {
                bail!("Budget must be a non-negative amount, got {}", amount);
            }
            tracker.set_monthly_budget(amount).context("Failed to save budget")?;
            if options.json {
                print_json(&tracker.status())?;
            } else {
                println!("{} Monthly budget set to {}", "✓".green(), money(amount));
            }
        }
        BudgetCommand::Alerts { state } => {
            let enabled = state == Toggle::On;
            tracker.set_alerts(enabled).context("Failed to save budget")?;
            if options.json {
                print_json(&serde_json::json!({ "budget_alerts": enabled }))?;
            } else {
                println!("{} Budget alerts {}", "✓".green(), if enabled { "enabled" } else { "disabled" });
            }
        }
    }
    Ok(0)
}
