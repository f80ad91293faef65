//! Training command implementation
//!
//! Generates the synthetic task stream, trains the tasks in order and prints
//! the accuracy matrix: row `i` is test accuracy on every task seen so far
//! after training task `i`.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use hypercmtl::{
    BaselineModel, ContinualTrainer, ExperimentConfig, HyperCmtl, MetricsRecorder, SyntheticTaskStream,
    TaskDataset, TaskModel, TaskSplit,
};
use std::path::{Path, PathBuf};
use tracing::info;

use super::{load_experiment, print_accuracy_row};

/// Arguments of the `train` command
pub struct TrainArgs {
    /// Experiment config file
    pub config: Option<PathBuf>,
    /// Number of tasks override
    pub tasks: Option<usize>,
    /// Distillation weight override
    pub stability: Option<f32>,
    /// Fisher penalty weight override
    pub ewc_lambda: Option<f32>,
    /// Train the multi-head EWC baseline instead of the hypernetwork model
    pub baseline: bool,
    /// Checkpoint output
    pub checkpoint: Option<PathBuf>,
    /// Metrics output
    pub metrics: Option<PathBuf>,
}

/// Run the train command
pub fn run(args: TrainArgs) -> Result<()> {
    if args.baseline && args.checkpoint.is_some() {
        bail!("--checkpoint is only supported for the hypernetwork model");
    }

    let mut experiment = load_experiment(args.config.as_deref())?;
    if let Some(tasks) = args.tasks {
        experiment.data.num_tasks = tasks;
    }
    if let Some(stability) = args.stability {
        experiment.training.stability = stability;
    }
    if let Some(ewc_lambda) = args.ewc_lambda {
        experiment.training.ewc_lambda = ewc_lambda;
    }
    if args.baseline {
        // plain EWC: no distillation
        experiment.training.stability = 0.0;
    }
    experiment.validate().context("invalid experiment configuration")?;

    let tasks = SyntheticTaskStream::new(experiment.data.clone())?
        .generate()
        .context("failed to generate tasks")?;

    if args.baseline {
        let model = BaselineModel::new(experiment.model.clone()).context("failed to build baseline")?;
        train_stream(model, &experiment, &tasks, args.metrics.as_deref())?;
        return Ok(());
    }

    let model = HyperCmtl::new(experiment.model.clone()).context("failed to build model")?;
    let trainer = train_stream(model, &experiment, &tasks, args.metrics.as_deref())?;
    if let Some(path) = &args.checkpoint {
        trainer
            .model()
            .state()
            .save(path)
            .with_context(|| format!("failed to write checkpoint to {}", path.display()))?;
        println!("{} {}", "Checkpoint:".dimmed(), path.display());
    }

    Ok(())
}

/// Train `model` on every task in order, printing the accuracy matrix
fn train_stream<M: TaskModel + Clone>(
    model: M,
    experiment: &ExperimentConfig,
    tasks: &[TaskSplit],
    metrics: Option<&Path>,
) -> Result<ContinualTrainer<M, MetricsRecorder>> {
    info!(
        tasks = tasks.len(),
        parameters = model.named_parameters().numel(),
        stability = experiment.training.stability,
        ewc_lambda = experiment.training.ewc_lambda,
        "starting experiment"
    );

    let mut trainer = ContinualTrainer::with_sink(model, experiment.training.clone(), MetricsRecorder::new())?;
    let tests: Vec<TaskDataset> = tasks.iter().map(|t| t.test.clone()).collect();

    println!();
    println!("{}", "Test accuracy after each task:".bold().cyan());
    for (i, split) in tasks.iter().enumerate() {
        trainer
            .fit_task(&split.train, Some(&split.val))
            .with_context(|| format!("training task {} failed", i))?;
        let report = trainer.evaluate_tasks(&tests[..=i])?;
        let row: Vec<f32> = report.tasks.iter().map(|e| e.accuracy).collect();
        print_accuracy_row(&format!("after {}", i), &row);
    }

    let final_report = trainer.evaluate_tasks(&tests)?;
    println!();
    println!(
        "{} {:.3}",
        "Average accuracy:".bold(),
        final_report.average_accuracy
    );

    if let Some(path) = metrics {
        trainer
            .sink()
            .save_json(path)
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
        println!("{} {}", "Metrics:".dimmed(), path.display());
    }

    Ok(trainer)
}
