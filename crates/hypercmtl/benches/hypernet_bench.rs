use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hypercmtl::{HyperCmtl, ModelConfig};
use ndarray::Array2;

fn model(embedding_dim: usize, hidden: usize) -> HyperCmtl {
    HyperCmtl::new(ModelConfig {
        embedding_dim,
        hypernetwork_hidden_width: hidden,
        ..ModelConfig::default()
    })
    .unwrap()
}

fn bench_generate(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_parameters");
    for hidden in [16, 64, 256] {
        let model = model(64, hidden);
        group.bench_with_input(BenchmarkId::from_parameter(hidden), &hidden, |b, _| {
            b.iter(|| model.get_parameters(black_box(0)).unwrap())
        });
    }
    group.finish();
}

fn bench_forward(c: &mut Criterion) {
    let model = model(64, 64);
    let mut group = c.benchmark_group("forward");
    for batch in [1, 32, 256] {
        let x = Array2::from_shape_fn((batch, 16), |(i, j)| ((i + j) as f32 * 0.1).sin());
        group.bench_with_input(BenchmarkId::from_parameter(batch), &x, |b, x| {
            b.iter(|| model.forward(black_box(x), 1).unwrap())
        });
    }
    group.finish();
}

fn bench_backward(c: &mut Criterion) {
    let model = model(64, 64);
    let x = Array2::from_shape_fn((64, 16), |(i, j)| ((i * j) as f32 * 0.05).cos());
    c.bench_function("forward_backward_64", |b| {
        b.iter(|| {
            let (logits, trace) = model.forward_traced(black_box(&x), 0, None).unwrap();
            model.backward(&trace, &Array2::ones(logits.raw_dim())).unwrap()
        })
    });
}

criterion_group!(benches, bench_generate, bench_forward, bench_backward);
criterion_main!(benches);
