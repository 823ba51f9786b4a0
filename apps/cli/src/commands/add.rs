//! `add` and `import` commands.

use super::{ParamArgs, print_json};
use crate::colors::{money, money_fine};
use crate::config::{CliOptions, build_orchestrator};
use anyhow::{Context, bail};
use clipforge_abstraction::GenerationParameters;
use clipforge_core::{BatchConfig, JobRequest};
use clipforge_orchestrator::{BatchOrchestrator, BulkAddOptions, PriorityStrategy};
use colored::Colorize;
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};

/// Extensions picked up when importing a directory.
const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

/// One entry of a JSON import file.
#[derive(Debug, Deserialize)]
struct ImportItem {
    input_ref: PathBuf,
    #[serde(default)]
    instruction: Option<String>,
    #[serde(default)]
    backend: Option<String>,
    #[serde(default)]
    parameters: GenerationParameters,
}

/// Execute the add command.
///
/// # Returns
/// 0 when the job was queued, 1 when it was rejected.
pub async fn execute_add(
    options: &CliOptions,
    config: BatchConfig,
    input: PathBuf,
    instruction: String,
    backend: String,
    priority: u8,
    params: &ParamArgs,
) -> anyhow::Result<i32> {
    let orchestrator = build_orchestrator(options, config, None, None)?;
    let request = JobRequest::new(input, instruction, backend)
        .with_priority(priority)
        .with_parameters(params.to_parameters()?);

    let job_id = match orchestrator.add_job(request).await {
        Ok(id) => id,
        Err(e) => {
            let Some(reason) = e.as_validation() else {
                return Err(e.into());
            };
            if options.json {
                print_json(&json!({ "added": false, "error": reason.to_string() }))?;
            } else {
                eprintln!("{} {}", "✗".red(), reason.to_string().red());
            }
            return Ok(1);
        }
    };

    let job = orchestrator.get_job(&job_id).await.context("Job vanished after insert")?;
    if options.json {
        print_json(&job)?;
        return Ok(0);
    }

    println!("{} Queued job {}", "✓".green(), job.id.cyan());
    println!("  Input:    {}", job.input_ref.display());
    println!("  Backend:  {}", job.backend);
    println!("  Priority: {}", job.priority);
    println!("  Estimate: {}", money_fine(job.estimated_cost));
    if let Some(warning) = &job.cost_warning {
        println!("  {} {}", "!".yellow(), warning.yellow());
    }
    Ok(0)
}

/// Execute the import command.
///
/// `path` is either a directory, whose images all get `instruction`, or a
/// JSON file holding a list of `{input_ref, instruction?, backend?, parameters?}`.
///
/// # Returns
/// 0 when at least one job was queued, 1 when every item was rejected.
pub async fn execute_import(
    options: &CliOptions,
    config: BatchConfig,
    path: &Path,
    instruction: Option<String>,
    backend: String,
    fixed_priority: Option<u8>,
    params: &ParamArgs,
) -> anyhow::Result<i32> {
    let requests: Vec<JobRequest> = if path.is_dir() {
        let Some(instruction) = instruction else {
            bail!("--instruction is required when importing a directory");
        };
        let images = collect_images(path)?;
        if images.is_empty() {
            bail!("No images found in {}", path.display());
        }
        images
            .into_iter()
            .map(|image| JobRequest::new(image, instruction.clone(), backend.clone()))
            .collect()
    } else {
        read_import_file(path, instruction.as_deref(), &backend)?
    };

    let orchestrator = build_orchestrator(options, config, None, None)?;
    let bulk = BulkAddOptions {
        shared_parameters: Some(params.to_parameters()?),
        shared_instruction: None,
        strategy: fixed_priority.map(PriorityStrategy::Fixed),
    };
    let inputs: Vec<PathBuf> = requests.iter().map(|r| r.input_ref.clone()).collect();
    let outcome = orchestrator.add_many(requests, &bulk).await?;
    let exit_code = i32::from(outcome.added.is_empty());

    if options.json {
        let rejected: Vec<_> = outcome
            .rejected
            .iter()
            .map(|(index, reason)| {
                json!({
                    "index": index,
                    "input_ref": inputs[*index].display().to_string(),
                    "error": reason.to_string(),
                })
            })
            .collect();
        print_json(&json!({ "added": outcome.added, "rejected": rejected }))?;
        return Ok(exit_code);
    }

    for (index, reason) in &outcome.rejected {
        eprintln!("{} {}: {}", "✗".red(), inputs[*index].display(), reason.to_string().red());
    }
    let estimate = estimated_total(&orchestrator, &outcome.added).await;
    println!(
        "{} Queued {} of {} job(s), estimated {}",
        if outcome.added.is_empty() { "✗".red() } else { "✓".green() },
        outcome.added.len().to_string().bold(),
        inputs.len(),
        money(estimate)
    );
    Ok(exit_code)
}

/// Image files directly under `dir`, sorted by name.
fn collect_images(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        let is_image = path.is_file()
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()));
        if is_image {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Requests from a JSON import file. Relative inputs resolve against the file's directory.
fn read_import_file(
    path: &Path,
    instruction: Option<&str>,
    backend: &str,
) -> anyhow::Result<Vec<JobRequest>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let items: Vec<ImportItem> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON list of jobs", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    Ok(items
        .into_iter()
        .map(|item| {
            let input = if item.input_ref.is_relative() { base.join(&item.input_ref) } else { item.input_ref };
            let instruction = item.instruction.or_else(|| instruction.map(str::to_string)).unwrap_or_default();
            JobRequest::new(input, instruction, item.backend.unwrap_or_else(|| backend.to_string()))
                .with_parameters(item.parameters)
        })
        .collect())
}

async fn estimated_total(orchestrator: &BatchOrchestrator, ids: &[String]) -> f64 {
    let mut total = 0.0;
    for id in ids {
        if let Some(job) = orchestrator.get_job(id).await {
            total += job.estimated_cost;
        }
    }
    total
}
