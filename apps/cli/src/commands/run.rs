//! `run` command: drains the queue with a live progress bar.

use super::print_json;
use crate::colors::{health_label, money, money_fine, primary_cell, truncate};
use crate::config::{CliOptions, budget_tracker, build_orchestrator};
use crate::generator::{GeneratorKind, build_generator};
use clap::Args;
use clipforge_core::{BatchConfig, BudgetTracker, JobEvent, format_duration};
use clipforge_orchestrator::BatchReport;
use colored::Colorize;
use comfy_table::{Cell, Table};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Arguments of `clipforge run`.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Worker slots (defaults to the configured concurrency)
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Do not retry failed attempts
    #[arg(long)]
    pub no_retry: bool,

    /// Generator that executes each job
    #[arg(long, value_enum, default_value = "mock")]
    pub generator: GeneratorKind,

    /// Outcome of every mock call (succeed, transient, permanent, hang)
    #[arg(long, default_value = "succeed")]
    pub mock_outcome: String,

    /// Latency of every mock call in milliseconds
    #[arg(long, default_value = "0")]
    pub mock_latency_ms: u64,

    /// Program run once per job by the command generator
    #[arg(long)]
    pub command: Option<String>,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

/// Execute the run command.
///
/// Ctrl+C stops the run: running jobs are cancelled and pending ones stay queued.
///
/// # Returns
/// The report's exit code: 1 if any job failed.
pub async fn execute(options: &CliOptions, config: BatchConfig, args: RunArgs) -> anyhow::Result<i32> {
    let concurrency = args.concurrency.unwrap_or(config.concurrency);
    let auto_retry = config.auto_retry && !args.no_retry;
    let generator =
        build_generator(args.generator, &args.mock_outcome, args.mock_latency_ms, args.command.as_deref())?;
    let budget = Arc::new(budget_tracker(options, &config));
    let orchestrator =
        Arc::new(build_orchestrator(options, config, Some(generator), Some(Arc::clone(&budget)))?);

    let interrupt = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping the run");
                orchestrator.cancel_run();
            }
        })
    };

    let display = if options.json || args.no_progress {
        None
    } else {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
        )?
        .progress_chars("=>-");
        Some(spawn_progress(orchestrator.subscribe(), style))
    };

    let result = orchestrator.run(concurrency, auto_retry).await;
    interrupt.abort();

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            if let Some(display) = display {
                display.abort();
            }
            return Err(e.into());
        }
    };
    if let Some(display) = display {
        if report.is_empty() {
            display.abort();
        } else if let Err(e) = display.await {
            debug!(error = %e, "Progress display ended abnormally");
        }
    }

    if options.json {
        print_json(&json!({ "report": report, "budget": budget.status() }))?;
    } else {
        print_report(&report);
        print_budget(&budget);
    }
    Ok(report.exit_code())
}

/// Renders events as a progress bar until the run finishes.
fn spawn_progress(mut events: broadcast::Receiver<JobEvent>, style: ProgressStyle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new(0).with_style(style);
        bar.enable_steady_tick(Duration::from_millis(100));

        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Progress display lagged behind events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            match event {
                JobEvent::RunStarted { jobs, .. } => bar.set_length(jobs as u64),
                JobEvent::Started { job_id, attempt } => {
                    bar.set_message(format!("{} attempt {}", short(&job_id), attempt));
                }
                JobEvent::Progress { job_id, stage, message, .. } => {
                    bar.set_message(format!("{} {}: {}", short(&job_id), stage, truncate(&message, 40)));
                }
                JobEvent::Completed { job_id, cost, .. } => {
                    bar.inc(1);
                    bar.println(format!("{} {} {}", "✓".green(), job_id, money_fine(cost).dimmed()));
                }
                JobEvent::RetryScheduled { job_id, retry_count, delay_ms, error } => {
                    bar.println(format!(
                        "{} {} retry {} in {}ms: {}",
                        "↻".yellow(),
                        job_id,
                        retry_count,
                        delay_ms,
                        error.yellow()
                    ));
                }
                JobEvent::Failed { job_id, error, .. } => {
                    bar.inc(1);
                    bar.println(format!("{} {} {}", "✗".red(), job_id, error.red()));
                }
                JobEvent::Cancelled { job_id, reason } => {
                    bar.inc(1);
                    bar.println(format!("{} {} {}", "•".dimmed(), job_id, reason.dimmed()));
                }
                JobEvent::PersistenceDegraded { error } => {
                    bar.println(format!("{} ledger write failed: {}", "!".red(), error.red()));
                }
                JobEvent::RunFinished { .. } => {
                    bar.finish_and_clear();
                    break;
                }
                JobEvent::Added { .. } | JobEvent::Removed { .. } => {}
            }
        }
    })
}

/// First block of the uuid, enough to tell jobs apart on one line.
fn short(job_id: &str) -> &str {
    let uuid = job_id.strip_prefix("job-").unwrap_or(job_id);
    uuid.split('-').next().unwrap_or(uuid)
}

fn print_report(report: &BatchReport) {
    if report.is_empty() {
        println!("  {} Nothing pending", "•".dimmed());
        return;
    }

    println!("{}", "Run Summary".bold().cyan());
    println!();
    println!("  Jobs:      {}", report.total.to_string().bold());
    println!("  Completed: {}", report.completed.to_string().green());
    println!("  Failed:    {}", report.failed.to_string().red());
    if report.cancelled > 0 {
        println!("  Cancelled: {}", report.cancelled.to_string().magenta());
    }
    if report.pending > 0 {
        println!("  Unfinished: {}", report.pending.to_string().yellow());
    }
    if report.completed + report.failed > 0 {
        println!("  Success:   {:.1}%", report.success_rate);
    }
    println!("  Retries:   {}", report.total_retries);
    println!("  Elapsed:   {}", format_duration(Duration::from_secs_f64(report.elapsed_secs)));
    if let Some(average) = report.average_job_secs {
        println!("  Avg job:   {}", format_duration(Duration::from_secs_f64(average)));
    }
    println!();

    println!("{}", "Costs:".bold());
    println!("  Estimated: {}", money(report.estimated_cost));
    println!("  Incurred:  {}", money(report.incurred_cost));
    if report.failed_cost_lost > 0.0 {
        println!("  Lost:      {}", money(report.failed_cost_lost).red());
    }
    if report.by_backend.len() > 1 {
        let mut table = Table::new();
        table.set_header(vec!["Backend", "Jobs", "Completed", "Incurred"]);
        for (backend, cost) in &report.by_backend {
            table.add_row(vec![
                primary_cell(backend),
                Cell::new(cost.jobs),
                Cell::new(cost.completed),
                Cell::new(money(cost.incurred)),
            ]);
        }
        println!("{}", table);
    }

    if !report.failures.is_empty() {
        println!();
        println!("{}", "Failures:".bold().red());
        for failure in &report.failures {
            println!(
                "  {} {} ({}) after {} retries: {}",
                "✗".red(),
                failure.job_id,
                failure.input_ref.display(),
                failure.retry_count,
                failure.error
            );
        }
    }
    if !report.warnings.is_empty() {
        println!();
        println!("{}", "Warnings:".bold().yellow());
        for warning in &report.warnings {
            println!("  {} {}", "!".yellow(), warning);
        }
    }
    if !report.durably_recorded {
        println!();
        println!("{}", "Some results could not be written to the ledger".red().bold());
    }
}

fn print_budget(budget: &BudgetTracker) {
    let status = budget.status();
    if status.monthly_budget <= 0.0 {
        return;
    }
    println!();
    println!(
        "  Budget: {} of {} ({:.1}%) {}",
        money(status.current_spending),
        money(status.monthly_budget),
        status.usage_percentage,
        health_label(status.health)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_job_id() {
        assert_eq!(short("job-3f2a9c1e-0000-4000-8000-000000000000"), "3f2a9c1e");
        assert_eq!(short("plain"), "plain");
    }

    #[tokio::test]
    async fn test_progress_display_stops_at_run_finished() {
        let (sender, receiver) = broadcast::channel(16);
        let display = spawn_progress(receiver, ProgressStyle::default_bar());

        sender.send(JobEvent::RunStarted { jobs: 1, concurrency: 1 }).unwrap();
        sender.send(JobEvent::Started { job_id: "a".into(), attempt: 1 }).unwrap();
        sender
            .send(JobEvent::Completed { job_id: "a".into(), backend: "b".into(), cost: 0.1, duration_ms: None })
            .unwrap();
        sender.send(JobEvent::RunFinished { completed: 1, failed: 0, cancelled: 0 }).unwrap();

        tokio::time::timeout(Duration::from_secs(5), display).await.unwrap().unwrap();
    }
}
