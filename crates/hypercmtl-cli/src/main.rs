//! HyperCMTL CLI - continual multi-task learning experiments
//!
//! ## Commands
//!
//! - `hypercmtl config` - Print the default experiment configuration
//! - `hypercmtl train` - Train on a synthetic task stream and report accuracy
//! - `hypercmtl eval` - Evaluate a saved checkpoint on the synthetic tasks

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{config, eval, train};

/// HyperCMTL - hypernetwork-conditioned continual learning
#[derive(Parser)]
#[command(name = "hypercmtl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the default experiment configuration as JSON
    Config,

    /// Train sequentially on a synthetic task stream
    Train {
        /// Experiment configuration (JSON); defaults are used when omitted
        #[arg(short, long, env = "HYPERCMTL_CONFIG")]
        config: Option<PathBuf>,

        /// Override the number of tasks
        #[arg(long)]
        tasks: Option<usize>,

        /// Override the distillation weight (0 disables distillation)
        #[arg(long)]
        stability: Option<f32>,

        /// Override the Fisher penalty weight (0 disables anchoring)
        #[arg(long)]
        ewc_lambda: Option<f32>,

        /// Train the multi-head EWC baseline (one owned head per task, no distillation)
        #[arg(long, conflicts_with = "checkpoint")]
        baseline: bool,

        /// Write a checkpoint of the final model
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Write recorded training metrics as JSON
        #[arg(long)]
        metrics: Option<PathBuf>,
    },

    /// Evaluate a checkpoint on the synthetic task stream
    Eval {
        /// Checkpoint written by `train --checkpoint`
        #[arg(long)]
        checkpoint: PathBuf,

        /// Experiment configuration used to regenerate the tasks
        #[arg(short, long, env = "HYPERCMTL_CONFIG")]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| log_level.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let result = match cli.command {
        Commands::Config => config::run(),

        Commands::Train {
            config,
            tasks,
            stability,
            ewc_lambda,
            baseline,
            checkpoint,
            metrics,
        } => train::run(train::TrainArgs {
            config,
            tasks,
            stability,
            ewc_lambda,
            baseline,
            checkpoint,
            metrics,
        }),

        Commands::Eval { checkpoint, config } => eval::run(&checkpoint, config.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}
