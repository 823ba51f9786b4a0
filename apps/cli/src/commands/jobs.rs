//! Queue inspection and maintenance: `remove`, `clear`, `list`, `show`, `status`.

use super::{parse_status, print_json};
use crate::colors::{money, money_fine, primary_cell, status_label, status_table_color, truncate};
use crate::config::{CliOptions, build_orchestrator};
use clipforge_core::{BatchConfig, Job, format_duration};
use colored::Colorize;
use comfy_table::{Cell, Table};
use serde_json::json;
use std::time::Duration;

/// Execute the remove command.
///
/// # Returns
/// 0 when the job was cancelled or signalled, 1 otherwise.
pub async fn execute_remove(options: &CliOptions, config: BatchConfig, job_id: &str) -> anyhow::Result<i32> {
    let orchestrator = build_orchestrator(options, config, None, None)?;
    let status = orchestrator.get_job(job_id).await.map(|job| job.status);
    let removed = orchestrator.remove_job(job_id).await?;

    if options.json {
        print_json(&json!({ "job_id": job_id, "removed": removed, "status": status }))?;
    } else if removed {
        println!("{} Cancelled job {}", "✓".green(), job_id.cyan());
    } else if let Some(status) = status {
        println!("{} Job {} is {}, nothing to cancel", "•".dimmed(), job_id.cyan(), status_label(status));
    } else {
        println!("{} No job with id {}", "✗".red(), job_id.cyan());
    }
    Ok(i32::from(!removed))
}

/// Execute the clear command.
pub async fn execute_clear(
    options: &CliOptions,
    config: BatchConfig,
    status: Option<&str>,
) -> anyhow::Result<i32> {
    let filter = parse_status(status)?;
    let orchestrator = build_orchestrator(options, config, None, None)?;
    let cleared = orchestrator.clear_queue(filter).await?;

    if options.json {
        print_json(&json!({ "cleared": cleared }))?;
    } else {
        let scope = filter.map_or_else(|| "job(s)".to_string(), |s| format!("{} job(s)", s));
        println!("{} Cleared {} {}", "✓".green(), cleared.to_string().bold(), scope);
    }
    Ok(0)
}

/// Execute the list command.
pub async fn execute_list(
    options: &CliOptions,
    config: BatchConfig,
    status: Option<&str>,
    limit: usize,
) -> anyhow::Result<i32> {
    let filter = parse_status(status)?;
    let orchestrator = build_orchestrator(options, config, None, None)?;
    let jobs = orchestrator.list_jobs(filter, Some(limit)).await;

    if options.json {
        print_json(&jobs)?;
        return Ok(0);
    }
    if jobs.is_empty() {
        println!("  {} No jobs in the queue", "•".dimmed());
        return Ok(0);
    }

    let mut table = Table::new();
    table.set_header(vec!["ID", "Status", "Pri", "Backend", "Input", "Instruction", "Retries", "Cost"]);
    for job in &jobs {
        let cost = job.incurred_cost.unwrap_or(job.estimated_cost);
        table.add_row(vec![
            primary_cell(&job.id),
            Cell::new(job.status).fg(status_table_color(job.status)),
            Cell::new(job.priority),
            Cell::new(&job.backend),
            Cell::new(truncate(&job.input_ref.display().to_string(), 32)),
            Cell::new(truncate(&job.instruction, 40)),
            Cell::new(format!("{}/{}", job.retry_count, job.max_retries)),
            Cell::new(money_fine(cost)),
        ]);
    }
    println!("{}", table);
    println!();
    println!("  {} Showing {} job(s)", "✓".green(), jobs.len());
    Ok(0)
}

/// Execute the show command.
pub async fn execute_show(options: &CliOptions, config: BatchConfig, job_id: &str) -> anyhow::Result<i32> {
    let orchestrator = build_orchestrator(options, config, None, None)?;
    let Some(job) = orchestrator.get_job(job_id).await else {
        if options.json {
            print_json(&json!({ "job_id": job_id, "found": false }))?;
        } else {
            println!("{} No job with id {}", "✗".red(), job_id.cyan());
        }
        return Ok(1);
    };

    if options.json {
        print_json(&job)?;
    } else {
        print_job(&job)?;
    }
    Ok(0)
}

fn print_job(job: &Job) -> anyhow::Result<()> {
    println!("{} {}", "Job".bold(), job.id.cyan());
    println!("  Status:      {}", status_label(job.status));
    println!("  Input:       {}", job.input_ref.display());
    println!("  Instruction: {}", job.instruction);
    println!("  Backend:     {}", job.backend);
    println!("  Priority:    {}", job.priority);
    println!("  Retries:     {}/{}", job.retry_count, job.max_retries);
    if let Some(after) = job.retry_after {
        println!("  Retry after: {}", after.to_rfc3339());
    }
    println!();

    println!("{}", "Timing:".bold());
    println!("  Created:   {}", job.created_at.to_rfc3339());
    if let Some(started) = job.started_at {
        println!("  Started:   {}", started.to_rfc3339());
    }
    if let Some(completed) = job.completed_at {
        println!("  Finished:  {}", completed.to_rfc3339());
    }
    if let Some(duration) = job.duration().and_then(|d| d.to_std().ok()) {
        println!("  Duration:  {}", format_duration(duration));
    }
    println!();

    println!("{}", "Cost:".bold());
    println!("  Estimated: {}", money_fine(job.estimated_cost));
    if let Some(incurred) = job.incurred_cost {
        println!("  Incurred:  {}", money_fine(incurred));
    }
    if let Some(warning) = &job.cost_warning {
        println!("  {} {}", "!".yellow(), warning.yellow());
    }

    let parameters = serde_json::to_value(&job.parameters)?;
    if parameters.as_object().is_some_and(|map| !map.is_empty()) {
        println!();
        println!("{}", "Parameters:".bold());
        println!("{}", serde_json::to_string_pretty(&parameters)?);
    }
    if let Some(error) = &job.error_message {
        println!();
        println!("{} {}", "Error:".bold().red(), error.red());
    }
    if !job.output_paths.is_empty() {
        println!();
        println!("{}", "Outputs:".bold());
        for path in &job.output_paths {
            println!("  {}", path.display());
        }
    }
    if let Some(result) = &job.result {
        println!();
        println!("{}", "Result:".bold());
        println!("{}", serde_json::to_string_pretty(result)?);
    }
    Ok(())
}

/// Execute the status command.
pub async fn execute_status(options: &CliOptions, config: BatchConfig) -> anyhow::Result<i32> {
    let concurrency = config.concurrency;
    let orchestrator = build_orchestrator(options, config, None, None)?;
    let stats = orchestrator.status().await;
    let estimate = stats.estimate_remaining(concurrency);

    if options.json {
        print_json(&json!({ "stats": stats, "time_estimate": estimate }))?;
        return Ok(0);
    }

    println!("{}", "Queue Status".bold().cyan());
    println!();
    println!("  Total:      {}", stats.total.to_string().bold());
    println!("  Pending:    {}", stats.pending.to_string().yellow());
    println!("  Processing: {}", stats.processing.to_string().blue());
    println!("  Completed:  {}", stats.completed.to_string().green());
    println!("  Failed:     {}", stats.failed.to_string().red());
    println!("  Cancelled:  {}", stats.cancelled.to_string().magenta());
    println!("  Retries:    {}", stats.total_retries);
    if stats.completed + stats.failed > 0 {
        println!("  Success:    {:.1}%", stats.success_rate);
    }
    if let Some(average) = stats.average_duration() {
        println!("  Avg job:    {}", format_duration(average));
    }
    println!();

    println!("{}", "Costs:".bold());
    println!("  Estimated:  {}", money(stats.costs.estimated_total));
    println!("  Incurred:   {}", money(stats.costs.incurred_total));
    if stats.costs.failed_cost_lost > 0.0 {
        println!("  Lost:       {}", money(stats.costs.failed_cost_lost).red());
    }
    if !stats.costs.by_backend.is_empty() {
        let mut table = Table::new();
        table.set_header(vec!["Backend", "Jobs", "Completed", "Estimated", "Incurred"]);
        for (backend, cost) in &stats.costs.by_backend {
            table.add_row(vec![
                primary_cell(backend),
                Cell::new(cost.jobs),
                Cell::new(cost.completed),
                Cell::new(money(cost.estimated)),
                Cell::new(money(cost.incurred)),
            ]);
        }
        println!("{}", table);
    }

    if estimate.remaining_jobs > 0 {
        println!();
        println!("{}", "Time Estimate:".bold());
        println!("  Remaining:  {} job(s)", estimate.remaining_jobs);
        println!("  Sequential: {}", format_duration(Duration::from_secs_f64(estimate.sequential_secs)));
        println!(
            "  With {} worker(s): {}",
            concurrency,
            format_duration(Duration::from_secs_f64(estimate.concurrent_secs))
        );
    }
    Ok(0)
}
