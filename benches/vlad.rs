use std::hint::black_box;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use ndarray::Array2;
use plastron::config::DESCRIPTOR_DIM;
use plastron::index::VladIndex;
use plastron::vlad;
use plastron::vocab::Vocabulary;
use rand::prelude::*;
use rand::rngs::StdRng;

fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| rng.random_range(0.0..255.0))
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("vlad_encode");
    let mut rng = StdRng::seed_from_u64(42);

    for k in [64, 256] {
        let vocab = Vocabulary::from_centers(random_matrix(&mut rng, k, DESCRIPTOR_DIM)).unwrap();
        // 一张典型腹甲照片的特征点数量
        for n in [2000, 10000] {
            let descriptors = random_matrix(&mut rng, n, DESCRIPTOR_DIM);
            group.throughput(Throughput::Elements(n as u64));
            group.bench_function(format!("k{k}_n{n}"), |b| {
                b.iter(|| vlad::encode_descriptors(black_box(descriptors.view()), &vocab))
            });
        }
    }
    group.finish();
}

fn bench_index_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("vlad_index");
    let mut rng = StdRng::seed_from_u64(42);
    let dim = 64 * DESCRIPTOR_DIM;

    for rows in [500, 5000] {
        let vectors = random_matrix(&mut rng, rows, dim);
        let index = VladIndex::build(vectors.view()).unwrap();
        let query = vectors.row(rows / 2).to_owned();
        group.bench_function(format!("exact_{rows}"), |b| b.iter(|| index.search(black_box(query.view()), 100)));
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_index_search);
criterion_main!(benches);
