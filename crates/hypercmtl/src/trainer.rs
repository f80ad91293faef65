//! Continual training loop
//!
//! [`ContinualTrainer`] owns the live model, one optimizer over all parameter
//! groups, the snapshot slot and the current Fisher anchor set. It drives any
//! [`TaskModel`]: the hypernetwork model by default, or the multi-head
//! baseline. Each call to
//! [`ContinualTrainer::train_step`] composes
//!
//! ```text
//! total = hard + stability · Σ_k distill_k + ewc_lambda · fisher_penalty
//! ```
//!
//! where `k` ranges over previously learned tasks, sums the gradients of every
//! term into one map and applies a single optimizer step.

use crate::config::{NonFinitePolicy, TrainingConfig};
use crate::data::{Batch, TaskDataset};
use crate::distill::DistillationEngine;
use crate::error::{HyperCmtlError, Result};
use crate::fisher::{FisherDiagonal, FisherEstimator};
use crate::loss::{accuracy, cross_entropy};
use crate::metrics::{MetricsSink, TracingSink};
use crate::model::{HyperCmtl, TaskModel};
use crate::optim::Optimizer;
use crate::scheduler::LearningRateScheduler;
use crate::snapshot::SnapshotManager;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Loss terms of one training step
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Cross-entropy on the current task
    pub hard_loss: f32,
    /// Distillation summed over old tasks, before weighting
    pub distillation_loss: f32,
    /// Fisher penalty, before weighting
    pub fisher_penalty: f32,
    /// Weighted sum actually minimised
    pub total_loss: f32,
    /// Batch accuracy on the current task (training mode)
    pub accuracy: f32,
}

/// Averages over one epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    /// Epoch index within the task
    pub epoch: usize,
    /// Mean total loss
    pub train_loss: f32,
    /// Mean batch accuracy
    pub train_accuracy: f32,
    /// Validation loss, when a validation set was given
    pub val_loss: Option<f32>,
    /// Validation accuracy, when a validation set was given
    pub val_accuracy: Option<f32>,
    /// Learning-rate multiplier used during the epoch
    pub lr_scale: f32,
}

/// Outcome of [`ContinualTrainer::fit_task`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    /// Task trained
    pub task_id: usize,
    /// Per-epoch summaries
    pub epochs: Vec<EpochSummary>,
    /// Best validation accuracy seen
    pub best_val_accuracy: Option<f32>,
}

/// Loss and accuracy on one dataset
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Task evaluated
    pub task_id: usize,
    /// Mean cross-entropy
    pub loss: f32,
    /// Fraction correct
    pub accuracy: f32,
}

/// Accuracy on several tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// One entry per dataset, in input order
    pub tasks: Vec<Evaluation>,
    /// Mean accuracy over `tasks`
    pub average_accuracy: f32,
}

/// Sequential multi-task trainer with distillation and Fisher anchoring
pub struct ContinualTrainer<M: TaskModel = HyperCmtl, S: MetricsSink = TracingSink> {
    model: M,
    optimizer: Optimizer,
    config: TrainingConfig,
    distiller: DistillationEngine,
    estimator: FisherEstimator,
    snapshots: SnapshotManager<M>,
    fisher: Option<FisherDiagonal>,
    scheduler: LearningRateScheduler,
    learned_tasks: BTreeSet<usize>,
    rng: StdRng,
    steps: usize,
    sink: S,
}

impl<M: TaskModel + Clone> ContinualTrainer<M, TracingSink> {
    /// Trainer reporting metrics as `debug!` events
    pub fn new(model: M, config: TrainingConfig) -> Result<Self> {
        Self::with_sink(model, config, TracingSink)
    }
}

impl<M: TaskModel + Clone, S: MetricsSink> ContinualTrainer<M, S> {
    /// Trainer reporting metrics to `sink`
    pub fn with_sink(model: M, config: TrainingConfig, sink: S) -> Result<Self> {
        config.validate()?;
        let groups = model.parameter_groups(&config.learning_rates);
        let optimizer = Optimizer::new(config.optimizer.clone(), groups)?;
        let distiller = DistillationEngine::new(config.temperature, config.non_finite_policy)?;

        Ok(Self {
            estimator: FisherEstimator::new(config.fisher_max_batches),
            scheduler: LearningRateScheduler::new(config.scheduler.clone()),
            rng: StdRng::seed_from_u64(config.seed),
            model,
            optimizer,
            config,
            distiller,
            snapshots: SnapshotManager::new(),
            fisher: None,
            learned_tasks: BTreeSet::new(),
            steps: 0,
            sink,
        })
    }

    /// Live model
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Training configuration
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Optimizer
    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    /// Snapshot slot
    pub fn snapshots(&self) -> &SnapshotManager<M> {
        &self.snapshots
    }

    /// Current anchor set
    pub fn fisher(&self) -> Option<&FisherDiagonal> {
        self.fisher.as_ref()
    }

    /// Tasks passed through [`ContinualTrainer::end_task`]
    pub fn learned_tasks(&self) -> impl Iterator<Item = usize> + '_ {
        self.learned_tasks.iter().copied()
    }

    /// Optimizer steps taken
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Metrics sink
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Make `task_id` trainable, handing any parameters the model creates
    /// for it to the optimizer.
    ///
    /// Called by [`ContinualTrainer::train_step`]; calling it again is a no-op.
    pub fn add_task(&mut self, task_id: usize) -> Result<()> {
        if let Some(group) = self.model.prepare_task(task_id, &self.config.learning_rates)? {
            info!(
                task_id,
                group = %group.name,
                parameters = group.parameters.len(),
                "registered task parameters"
            );
            self.optimizer.add_group(group)?;
        }
        Ok(())
    }

    /// One forward/backward/update on a batch of `batch.task_id`
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepMetrics> {
        let task_id = batch.task_id;
        self.add_task(task_id)?;
        let (logits, trace) = self.model.forward_traced(&batch.inputs, task_id, Some(&mut self.rng))?;
        let (hard_loss, grad_logits) = cross_entropy(&logits, &batch.labels)?;
        let mut grads = self.model.backward(&trace, &grad_logits)?;
        let batch_accuracy = accuracy(&logits, &batch.labels);

        let stability = self.config.stability;
        let mut distillation_loss = 0.0f32;
        if stability > 0.0 {
            if let Some(teacher) = self.snapshots.current() {
                for &old_task in self.learned_tasks.iter().filter(|&&k| k != task_id) {
                    let teacher_logits = teacher.forward(&batch.inputs, old_task)?;
                    let (student_logits, student_trace) =
                        self.model.forward_traced(&batch.inputs, old_task, Some(&mut self.rng))?;
                    let out = self.distiller.loss(&student_logits, &teacher_logits)?;
                    distillation_loss += out.mean;
                    let old_grads = self.model.backward(&student_trace, &(out.grad_student * stability))?;
                    grads.merge_scaled(&old_grads, 1.0)?;
                }
            }
        }

        let ewc_lambda = self.config.ewc_lambda;
        let mut fisher_penalty = 0.0f32;
        if ewc_lambda > 0.0 {
            if let Some(fisher) = &self.fisher {
                fisher_penalty = fisher.penalty(&self.model);
                grads.merge_scaled(&fisher.gradient(&self.model), ewc_lambda)?;
            }
        }

        let total_loss = hard_loss + stability * distillation_loss + ewc_lambda * fisher_penalty;

        if grads.is_finite() {
            if let Some(max_norm) = self.config.grad_clip {
                let norm = grads.clip_global_norm(max_norm);
                if norm > max_norm {
                    debug!(norm, max_norm, "clipped gradients");
                }
            }
            self.optimizer.step(&mut self.model, &grads)?;
        } else {
            match self.config.non_finite_policy {
                NonFinitePolicy::Warn => {
                    warn!(task_id, step = self.steps, "non-finite gradients, skipping update");
                }
                NonFinitePolicy::Abort => {
                    return Err(HyperCmtlError::numerical(format!(
                        "non-finite gradients at step {}",
                        self.steps
                    )));
                }
            }
        }

        let metrics = StepMetrics {
            hard_loss,
            distillation_loss,
            fisher_penalty,
            total_loss,
            accuracy: batch_accuracy,
        };
        self.record_step(&metrics);
        self.steps += 1;
        Ok(metrics)
    }

    fn record_step(&mut self, m: &StepMetrics) {
        let step = self.steps;
        self.sink.record("train/hard_loss", m.hard_loss as f64, step);
        self.sink.record("train/distillation_loss", m.distillation_loss as f64, step);
        self.sink.record("train/fisher_penalty", m.fisher_penalty as f64, step);
        self.sink.record("train/total_loss", m.total_loss as f64, step);
        self.sink.record("train/accuracy", m.accuracy as f64, step);
    }

    /// Close training of `task_id`.
    ///
    /// Marks the task as learned, replaces the snapshot and, when the Fisher
    /// penalty is enabled, re-estimates the anchor set from `fisher_batches`.
    pub fn end_task<'a, I>(&mut self, task_id: usize, fisher_batches: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Batch>,
    {
        if task_id >= self.model.task_capacity() {
            return Err(HyperCmtlError::capacity(task_id, self.model.task_capacity()));
        }
        self.learned_tasks.insert(task_id);
        self.snapshots.capture(&self.model, task_id);

        if self.config.ewc_lambda > 0.0 {
            let fisher = self.estimator.estimate(&self.model, task_id, fisher_batches)?;
            let stats = fisher.stats();
            info!(
                task_id,
                batches = stats.batches_used,
                mean_importance = stats.mean_importance,
                max_importance = stats.max_importance,
                "updated Fisher anchors"
            );
            self.fisher = Some(fisher);
        }

        info!(task_id, learned = self.learned_tasks.len(), "task finished");
        self.sink.flush();
        Ok(())
    }

    /// Train `train.task_id()` for `epochs_per_task` epochs, then [`ContinualTrainer::end_task`]
    pub fn fit_task(&mut self, train: &TaskDataset, val: Option<&TaskDataset>) -> Result<TaskReport> {
        if train.is_empty() {
            return Err(HyperCmtlError::invalid_input("empty training set"));
        }
        let task_id = train.task_id();
        self.scheduler.reset();
        self.optimizer.set_lr_scale(self.scheduler.scale());

        let mut epochs = Vec::with_capacity(self.config.epochs_per_task);
        let mut best_val_accuracy: Option<f32> = None;

        for epoch in 0..self.config.epochs_per_task {
            let lr_scale = self.optimizer.lr_scale();
            let mut loss_sum = 0.0f32;
            let mut acc_sum = 0.0f32;
            let mut n_batches = 0usize;
            for batch in train.batches(self.config.batch_size, true, &mut self.rng) {
                let m = self.train_step(&batch)?;
                loss_sum += m.total_loss;
                acc_sum += m.accuracy;
                n_batches += 1;
            }
            let train_loss = loss_sum / n_batches.max(1) as f32;
            let train_accuracy = acc_sum / n_batches.max(1) as f32;

            let val_eval = match val {
                Some(v) if !v.is_empty() => Some(self.evaluate(v)?),
                _ => None,
            };
            if let Some(e) = val_eval {
                if best_val_accuracy.map_or(true, |best| e.accuracy > best) {
                    best_val_accuracy = Some(e.accuracy);
                }
                self.sink.record("val/loss", e.loss as f64, self.steps);
                self.sink.record("val/accuracy", e.accuracy as f64, self.steps);
            }

            let summary = EpochSummary {
                epoch,
                train_loss,
                train_accuracy,
                val_loss: val_eval.map(|e| e.loss),
                val_accuracy: val_eval.map(|e| e.accuracy),
                lr_scale,
            };
            info!(
                task_id,
                epoch = epoch + 1,
                train_loss,
                train_accuracy,
                val_accuracy = ?summary.val_accuracy,
                "epoch finished"
            );
            epochs.push(summary);

            let next = self.scheduler.step(summary.val_loss.or(Some(train_loss)));
            self.optimizer.set_lr_scale(next);
        }

        let fisher_batches: Vec<Batch> = train
            .batches(self.config.batch_size, true, &mut self.rng)
            .take(self.estimator.max_batches())
            .collect();
        self.end_task(task_id, &fisher_batches)?;

        Ok(TaskReport {
            task_id,
            epochs,
            best_val_accuracy,
        })
    }

    /// Mean loss and accuracy of the live model on `dataset`, inference mode
    pub fn evaluate(&self, dataset: &TaskDataset) -> Result<Evaluation> {
        evaluate_model(&self.model, dataset, self.config.batch_size)
    }

    /// Accuracy on every dataset and their mean
    pub fn evaluate_tasks(&self, datasets: &[TaskDataset]) -> Result<EvaluationReport> {
        evaluate_tasks(&self.model, datasets, self.config.batch_size)
    }
}

/// Mean loss and accuracy of `model` on `dataset`, inference mode
pub fn evaluate_model<M: TaskModel + ?Sized>(model: &M, dataset: &TaskDataset, batch_size: usize) -> Result<Evaluation> {
    if dataset.is_empty() {
        return Err(HyperCmtlError::invalid_input("empty evaluation set"));
    }
    let mut loss_sum = 0.0f32;
    let mut correct = 0.0f32;
    for batch in dataset.batches_in_order(batch_size) {
        let logits = model.forward(&batch.inputs, batch.task_id)?;
        let (loss, _) = cross_entropy(&logits, &batch.labels)?;
        let n = batch.len() as f32;
        loss_sum += loss * n;
        correct += accuracy(&logits, &batch.labels) * n;
    }
    let n = dataset.len() as f32;
    Ok(Evaluation {
        task_id: dataset.task_id(),
        loss: loss_sum / n,
        accuracy: correct / n,
    })
}

/// [`evaluate_model`] over several datasets
pub fn evaluate_tasks<M: TaskModel + ?Sized>(
    model: &M,
    datasets: &[TaskDataset],
    batch_size: usize,
) -> Result<EvaluationReport> {
    let tasks = datasets
        .iter()
        .map(|d| evaluate_model(model, d, batch_size))
        .collect::<Result<Vec<_>>>()?;
    let average_accuracy = if tasks.is_empty() {
        0.0
    } else {
        tasks.iter().map(|e| e.accuracy).sum::<f32>() / tasks.len() as f32
    };
    Ok(EvaluationReport {
        tasks,
        average_accuracy,
    })
}
