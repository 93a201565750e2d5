//! Debate runner CLI.
//!
//! # Usage
//!
//! ```bash
//! # Roll out every incomplete row, resuming from checkpoints
//! debate-runner --config debate.toml debate
//!
//! # Judge the first two rounds of each swapped transcript
//! debate-runner --config debate.toml judge --swap --round-limit 2
//!
//! # Progress of the current dataset
//! debate-runner --config debate.toml status
//! ```
//!
//! Keys come from `OPENAI_API_KEY`, `OPENAI_ORGANIZATION` and `ANTHROPIC_API_KEY`.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use debate_runner::config::RunnerConfig;
use debate_runner::dataset::Dataset;
use debate_runner::driver::Driver;
use debate_runner::setup;
use tracing::info;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the runner TOML config
    #[arg(long)]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run or resume rollouts for every incomplete row
    Debate {
        /// Swap the answer order
        #[arg(long, default_value_t = false)]
        swap: bool,

        /// Only process the first N rows (overrides `limit` in the config)
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Judge completed transcripts
    Judge {
        #[arg(long, default_value_t = false)]
        swap: bool,

        /// Only show the judge the first N rounds
        #[arg(long)]
        round_limit: Option<usize>,

        #[arg(long)]
        limit: Option<usize>,
    },
    /// Report completed rows and checkpointed steps
    Status {
        #[arg(long, default_value_t = false)]
        swap: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .init();

    let config = RunnerConfig::from_file(&cli.config)?;
    info!(
        dataset = %config.dataset.display(),
        method = ?config.method,
        rollout = %config.rollout.rollout_type,
        steps = config.rollout.num_steps,
        "Debate runner starting"
    );
    let dispatcher = setup::build_dispatcher(&config)?;
    let driver = Driver::new(config, dispatcher.clone());
    let started = Instant::now();

    match cli.command {
        Command::Debate { swap, limit } => {
            let all_complete = driver.run_debates(swap, limit).await?;
            info!(
                elapsed_secs = started.elapsed().as_secs(),
                cost = dispatcher.running_cost(),
                "Debates finished"
            );
            if !all_complete {
                bail!("some rows are still incomplete; rerun to resume them");
            }
        }
        Command::Judge {
            swap,
            round_limit,
            limit,
        } => {
            let summary = driver.run_judge(swap, round_limit, limit).await?;
            info!(
                elapsed_secs = started.elapsed().as_secs(),
                cost = dispatcher.running_cost(),
                "Judging finished"
            );
            if !summary.all_complete() {
                bail!(
                    "{} of {} judgements failed",
                    summary.processed - summary.complete,
                    summary.processed
                );
            }
        }
        Command::Status { swap } => {
            let dataset = Dataset::load(&driver.dataset_path(swap))?;
            println!(
                "{}: {}/{} rows complete",
                dataset.path().display(),
                dataset.complete_count(),
                dataset.rows.len()
            );
            for (index, _) in dataset.rows.iter().enumerate().filter(|(_, r)| !r.complete) {
                let steps = driver.checkpointed_steps(index as u64, swap)?;
                println!(
                    "  row {index}: {steps}/{} steps checkpointed",
                    driver.config().rollout.num_steps
                );
            }
        }
    }

    Ok(())
}
