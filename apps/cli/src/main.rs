//! clipforge CLI - batch queue for image-to-video generation.
//!
//! Jobs are added to a persistent ledger and drained by `clipforge run`
//! through a generator, at most N at a time.

mod colors;
mod commands;
mod config;
mod generator;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{ParamArgs, add, budget, jobs, pricing, run};

/// clipforge - batch image-to-video generation queue
#[derive(Parser, Debug)]
#[command(
    name = "clipforge",
    author,
    version,
    about = "Batch queue for image-to-video generation jobs",
    long_about = "clipforge keeps a persistent ledger of generation jobs and drains it\nthrough a generator with bounded concurrency, retries and cost tracking."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Configuration file, applied over the global and local ones
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Ledger file (overrides the configured path)
    #[arg(long, global = true)]
    ledger: Option<PathBuf>,

    /// Keep changes in memory only; the ledger file is read but never written
    #[arg(long, global = true)]
    no_persist: bool,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add one job to the queue
    Add {
        /// Source image
        input: PathBuf,

        /// What the clip should show
        #[arg(short, long)]
        instruction: String,

        /// Backend model
        #[arg(short, long, default_value = "kling_21_standard")]
        backend: String,

        /// Priority from 1 (low) to 5 (urgent)
        #[arg(short, long, default_value = "3")]
        priority: u8,

        #[command(flatten)]
        params: ParamArgs,
    },

    /// Add many jobs from a directory of images or a JSON list
    ///
    /// Later items get lower priority so large imports do not starve
    /// jobs added on their own.
    Import {
        /// Directory of images, or a JSON file with a list of jobs
        path: PathBuf,

        /// Instruction for every job (required for directories)
        #[arg(short, long)]
        instruction: Option<String>,

        /// Backend for items that do not name one
        #[arg(short, long, default_value = "kling_21_standard")]
        backend: String,

        /// Give every job this priority instead of the decaying one
        #[arg(long)]
        fixed_priority: Option<u8>,

        #[command(flatten)]
        params: ParamArgs,
    },

    /// Cancel a pending or running job
    Remove {
        /// Job id
        job_id: String,
    },

    /// Delete jobs from the ledger
    Clear {
        /// Only jobs in this status (pending, completed, failed, cancelled)
        #[arg(long)]
        status: Option<String>,
    },

    /// List jobs in queue order
    List {
        /// Only jobs in this status
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of jobs
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show one job in detail
    Show {
        /// Job id
        job_id: String,
    },

    /// Show queue totals, costs and time estimates
    Status,

    /// Process every pending job
    Run(run::RunArgs),

    /// Compare backend prices and estimate batches
    Pricing {
        #[command(subcommand)]
        command: pricing::PricingCommand,
    },

    /// Show or set the monthly budget
    Budget {
        #[command(subcommand)]
        command: budget::BudgetCommand,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let options = config::CliOptions {
        config: args.config,
        ledger: args.ledger,
        no_persist: args.no_persist,
        json: args.json,
    };
    let batch_config = config::load_config(&options)?;

    let exit_code = match args.command {
        Command::Add { input, instruction, backend, priority, params } => {
            add::execute_add(&options, batch_config, input, instruction, backend, priority, &params)
                .await?
        }
        Command::Import { path, instruction, backend, fixed_priority, params } => {
            add::execute_import(&options, batch_config, &path, instruction, backend, fixed_priority, &params)
                .await?
        }
        Command::Remove { job_id } => jobs::execute_remove(&options, batch_config, &job_id).await?,
        Command::Clear { status } => jobs::execute_clear(&options, batch_config, status.as_deref()).await?,
        Command::List { status, limit } => {
            jobs::execute_list(&options, batch_config, status.as_deref(), limit).await?
        }
        Command::Show { job_id } => jobs::execute_show(&options, batch_config, &job_id).await?,
        Command::Status => jobs::execute_status(&options, batch_config).await?,
        Command::Run(run_args) => run::execute(&options, batch_config, run_args).await?,
        Command::Pricing { command } => pricing::execute(&options, &batch_config, command)?,
        Command::Budget { command } => budget::execute(&options, &batch_config, command)?,
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
