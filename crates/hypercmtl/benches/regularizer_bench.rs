use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hypercmtl::{
    Batch, ContinualTrainer, DistillationEngine, FisherEstimator, HyperCmtl, ModelConfig, NonFinitePolicy,
    NullSink, TrainingConfig,
};
use ndarray::Array2;

fn batch(task_id: usize) -> Batch {
    let inputs = Array2::from_shape_fn((64, 16), |(i, j)| ((i * 16 + j) as f32 * 0.013).sin());
    Batch::new(inputs, (0..64).map(|i| i % 2).collect(), task_id).unwrap()
}

fn bench_distillation_loss(c: &mut Criterion) {
    let engine = DistillationEngine::new(2.0, NonFinitePolicy::Warn).unwrap();
    let mut group = c.benchmark_group("distillation_loss");
    for classes in [2, 10, 100] {
        let student = Array2::from_shape_fn((64, classes), |(i, j)| (i as f32 - j as f32) * 0.1);
        let teacher = Array2::from_shape_fn((64, classes), |(i, j)| (j as f32 - i as f32) * 0.1);
        group.bench_with_input(BenchmarkId::from_parameter(classes), &classes, |b, _| {
            b.iter(|| engine.loss(black_box(&student), black_box(&teacher)).unwrap())
        });
    }
    group.finish();
}

fn bench_fisher(c: &mut Criterion) {
    let model = HyperCmtl::new(ModelConfig::default()).unwrap();
    let batches: Vec<Batch> = (0..4).map(|_| batch(0)).collect();
    let estimator = FisherEstimator::new(4);
    c.bench_function("fisher_estimate_4x64", |b| {
        b.iter(|| estimator.estimate(&model, 0, batches.iter()).unwrap())
    });

    let fisher = estimator.estimate(&model, 0, batches.iter()).unwrap();
    c.bench_function("fisher_penalty", |b| b.iter(|| fisher.penalty(black_box(&model))));
}

/// Step cost grows with the number of tasks distilled against
fn bench_train_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("train_step");
    group.sample_size(20);
    for learned in [0usize, 1, 4] {
        let model = HyperCmtl::new(ModelConfig::default()).unwrap();
        let mut trainer = ContinualTrainer::with_sink(model, TrainingConfig::default(), NullSink).unwrap();
        for task in 0..learned {
            trainer.end_task(task, std::iter::empty()).unwrap();
        }
        let current = batch(learned);
        group.bench_with_input(BenchmarkId::from_parameter(learned), &learned, |b, _| {
            b.iter(|| trainer.train_step(black_box(&current)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_distillation_loss, bench_fisher, bench_train_step);
criterion_main!(benches);
