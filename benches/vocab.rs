use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use ndarray::Array2;
use plastron::config::{DESCRIPTOR_DIM, TrainOptions};
use plastron::vocab::{self, IncrementalTrainer};
use rand::prelude::*;
use rand::rngs::StdRng;

// 在若干个中心附近生成描述符，模拟同一批图片的特征分布
fn clustered(rng: &mut StdRng, n: usize, clusters: usize) -> Array2<f32> {
    let centers = Array2::from_shape_fn((clusters, DESCRIPTOR_DIM), |_| rng.random_range(0.0..255.0f32));
    Array2::from_shape_fn((n, DESCRIPTOR_DIM), |(i, j)| centers[[i % clusters, j]] + rng.random_range(-8.0..8.0))
}

fn bench_partial_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("incremental_kmeans");
    let mut rng = StdRng::seed_from_u64(42);

    for (n, k) in [(10000, 64), (30000, 256)] {
        let batch = clustered(&mut rng, n, k / 2);
        group.bench_function(format!("partial_fit_{n}_{k}"), |b| {
            b.iter(|| {
                let mut trainer = IncrementalTrainer::new(k, 42).unwrap();
                trainer.partial_fit(black_box(batch.clone()));
                trainer.finish()
            })
        });
    }
    group.finish();
}

fn bench_train(c: &mut Criterion) {
    let mut group = c.benchmark_group("vocabulary");
    group.sample_size(10);
    let mut rng = StdRng::seed_from_u64(42);
    let images = (0..20).map(|_| clustered(&mut rng, 3000, 32)).collect::<Vec<_>>();
    let opts = TrainOptions { batch_images: 5, ..Default::default() };

    group.bench_function("train_20_images", |b| b.iter(|| vocab::train(images.iter().cloned(), &opts)));
    group.finish();
}

criterion_group!(benches, bench_partial_fit, bench_train);
criterion_main!(benches);
