//! End-to-end continual learning on two conflicting synthetic tasks
//!
//! Task 1 uses the same inputs as task 0 with the labels swapped, so a model
//! that shares everything but a near-identical embedding forgets task 0
//! unless something holds its old predictions in place.

use hypercmtl::{
    BackboneConfig, BaselineModel, ContinualTrainer, HyperCmtl, LearningRates, MetricsRecorder, MetricsSink,
    ModelConfig, OptimizerConfig, SyntheticTaskConfig, SyntheticTaskStream, TaskGeometry, TaskModel, TaskSplit,
    TrainingConfig,
};

fn tasks() -> Vec<TaskSplit> {
    SyntheticTaskStream::new(SyntheticTaskConfig {
        num_tasks: 2,
        input_dim: 8,
        samples_per_class: 200,
        margin: 2.0,
        noise_std: 0.5,
        val_fraction: 0.2,
        test_fraction: 0.2,
        geometry: TaskGeometry::Alternating,
        seed: 11,
    })
    .unwrap()
    .generate()
    .unwrap()
}

fn model_config() -> ModelConfig {
    ModelConfig {
        task_capacity: 2,
        input_dim: 8,
        embedding_dim: 8,
        hypernetwork_hidden_width: 16,
        hypernetwork_depth: 1,
        head_hidden_width: 8,
        num_classes: 2,
        head_dropout: 0.0,
        backbone: BackboneConfig {
            name: "mlp".to_string(),
            hidden_dims: vec![16],
            frozen: false,
        },
        ..ModelConfig::default()
    }
}

fn model() -> HyperCmtl {
    HyperCmtl::new(model_config()).unwrap()
}

fn training(stability: f32, ewc_lambda: f32) -> TrainingConfig {
    TrainingConfig {
        epochs_per_task: 15,
        batch_size: 32,
        learning_rates: LearningRates {
            embeddings: 5e-3,
            hypernet: 5e-3,
            backbone: 5e-3,
        },
        optimizer: OptimizerConfig::Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        },
        stability,
        ewc_lambda,
        ..TrainingConfig::default()
    }
}

/// Task-0 validation accuracy after task 0 and after task 1, plus task-1 accuracy at the end
fn run<M, S>(trainer: &mut ContinualTrainer<M, S>, tasks: &[TaskSplit]) -> (f32, f32, f32)
where
    M: TaskModel + Clone,
    S: MetricsSink,
{
    trainer.fit_task(&tasks[0].train, Some(&tasks[0].val)).unwrap();
    let learned = trainer.evaluate(&tasks[0].val).unwrap().accuracy;
    trainer.fit_task(&tasks[1].train, Some(&tasks[1].val)).unwrap();
    let retained = trainer.evaluate(&tasks[0].val).unwrap().accuracy;
    let current = trainer.evaluate(&tasks[1].val).unwrap().accuracy;
    (learned, retained, current)
}

#[test]
fn distillation_reduces_forgetting() {
    let tasks = tasks();
    // same Fisher anchoring in both runs; only distillation differs
    let ewc_lambda = 1.0;

    let mut anchored =
        ContinualTrainer::with_sink(model(), training(0.0, ewc_lambda), MetricsRecorder::new()).unwrap();
    let (anchored_learned, anchored_retained, anchored_current) = run(&mut anchored, &tasks);

    let mut distilled =
        ContinualTrainer::with_sink(model(), training(10.0, ewc_lambda), MetricsRecorder::new()).unwrap();
    let (distilled_learned, distilled_retained, _) = run(&mut distilled, &tasks);

    // identical until the first boundary
    assert_eq!(anchored_learned, distilled_learned);
    assert!(anchored_learned > 0.8, "task 0 not learned: {}", anchored_learned);
    assert!(anchored_current > 0.8, "task 1 not learned: {}", anchored_current);

    assert!(anchored.fisher().is_some());
    assert!(distilled.fisher().is_some());
    assert!(
        distilled_retained > anchored_retained,
        "distillation retained {} vs {} without",
        distilled_retained,
        anchored_retained
    );

    let distill_series = distilled.sink().series("train/distillation_loss");
    assert!(distill_series.iter().any(|p| p.value > 0.0));
    assert!(anchored.sink().series("train/distillation_loss").iter().all(|p| p.value == 0.0));
}

#[test]
fn fisher_anchoring_runs_end_to_end() {
    let tasks = tasks();
    let mut trainer = ContinualTrainer::with_sink(model(), training(0.0, 50.0), MetricsRecorder::new()).unwrap();
    let (learned, _, _) = run(&mut trainer, &tasks);
    assert!(learned > 0.8);

    let fisher = trainer.fisher().unwrap();
    assert_eq!(fisher.task_id(), 1);
    assert!(fisher.stats().mean_importance > 0.0);
    let penalties = trainer.sink().series("train/fisher_penalty");
    assert!(penalties.iter().any(|p| p.value > 0.0));
    assert!(trainer.sink().last("train/total_loss").unwrap().is_finite());
}

#[test]
fn multi_head_baseline_runs_end_to_end() {
    let tasks = tasks();
    let baseline = BaselineModel::new(model_config()).unwrap();
    let mut trainer = ContinualTrainer::with_sink(baseline, training(0.0, 50.0), MetricsRecorder::new()).unwrap();
    let (learned, _, current) = run(&mut trainer, &tasks);
    assert!(learned > 0.8, "task 0 not learned: {}", learned);
    assert!(current > 0.8, "task 1 not learned: {}", current);

    assert_eq!(trainer.model().task_ids().collect::<Vec<_>>(), vec![0, 1]);
    let fisher = trainer.fisher().unwrap();
    assert!(fisher.names().any(|n| n.starts_with("task_heads.0.")));
    assert!(fisher.names().any(|n| n.starts_with("task_heads.1.")));
    assert!(fisher.names().any(|n| n.starts_with("backbone.")));
    assert!(trainer.sink().series("train/fisher_penalty").iter().any(|p| p.value > 0.0));
}
