//! Checkpoint evaluation command

use anyhow::{bail, Context, Result};
use colored::Colorize;
use hypercmtl::trainer::evaluate_tasks;
use hypercmtl::{HyperCmtl, ModelState, SyntheticTaskStream, TaskDataset};
use std::path::Path;

use super::{load_experiment, print_accuracy_row};

/// Run the eval command
pub fn run(checkpoint: &Path, config: Option<&Path>) -> Result<()> {
    let experiment = load_experiment(config)?;
    let state = ModelState::load(checkpoint)
        .with_context(|| format!("failed to read checkpoint {}", checkpoint.display()))?;
    if state.config != experiment.model {
        tracing::warn!("checkpoint model config differs from the experiment config; using the checkpoint's");
    }
    let model = HyperCmtl::from_state(&state).context("checkpoint does not match its own config")?;

    if experiment.data.input_dim != model.config().input_dim {
        bail!(
            "task input width {} does not match model input width {}",
            experiment.data.input_dim,
            model.config().input_dim
        );
    }
    let tests: Vec<TaskDataset> = SyntheticTaskStream::new(experiment.data.clone())?
        .generate()?
        .into_iter()
        .map(|t| t.test)
        .collect();
    if tests.len() > model.task_capacity() {
        bail!(
            "{} tasks exceed the checkpoint's capacity of {}",
            tests.len(),
            model.task_capacity()
        );
    }

    let report = evaluate_tasks(&model, &tests, experiment.training.batch_size)?;
    println!();
    println!("{} {}", "Checkpoint:".bold().cyan(), checkpoint.display());
    let row: Vec<f32> = report.tasks.iter().map(|e| e.accuracy).collect();
    print_accuracy_row("test", &row);
    println!("{} {:.3}", "Average accuracy:".bold(), report.average_accuracy);
    Ok(())
}
