//! CLI command implementations
//!
//! - `config` - Print the default experiment configuration
//! - `train` - Run a synthetic continual-learning experiment
//! - `eval` - Evaluate a checkpoint

pub mod config;
pub mod eval;
pub mod train;

use anyhow::{Context, Result};
use colored::Colorize;
use hypercmtl::ExperimentConfig;
use std::path::Path;

/// Load `path`, or fall back to the defaults
pub fn load_experiment(path: Option<&Path>) -> Result<ExperimentConfig> {
    match path {
        Some(path) => ExperimentConfig::from_json_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(ExperimentConfig::default()),
    }
}

/// Print an accuracy row, one column per task
pub fn print_accuracy_row(label: &str, accuracies: &[f32]) {
    let cells: Vec<String> = accuracies
        .iter()
        .map(|&a| {
            let cell = format!("{:>6.3}", a);
            if a >= 0.9 {
                cell.green().to_string()
            } else if a >= 0.6 {
                cell.yellow().to_string()
            } else {
                cell.red().to_string()
            }
        })
        .collect();
    println!("  {:<12} {}", label.dimmed(), cells.join(" "));
}
