use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use imatch::forest::{ApproximateIndex, ForestParams, IndexEntry};
use imatch::hamming::Descriptor;
use imatch::refine::refine;
use imatch::search_config::RefineParams;
use imatch::store::{ImageId, ImageRecord};
use rand::prelude::*;

fn random_codes(rng: &mut StdRng, n: usize) -> Vec<Descriptor> {
    (0..n)
        .map(|_| {
            let mut d = [0u8; 32];
            rng.fill_bytes(&mut d);
            d
        })
        .collect()
}

fn entries(n: usize) -> Vec<IndexEntry> {
    let mut rng = StdRng::seed_from_u64(0);
    random_codes(&mut rng, n)
        .into_iter()
        .enumerate()
        .map(|(i, descriptor)| IndexEntry { descriptor, owner: ImageId(i as u64 / 500) })
        .collect()
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("Forest build");
    group.sample_size(10);
    let entries = entries(100_000);
    for tree_count in [1, 10] {
        group.bench_with_input(BenchmarkId::from_parameter(tree_count), &tree_count, |b, &n| {
            let params = ForestParams { tree_count: n, ..Default::default() };
            b.iter(|| ApproximateIndex::build_with(entries.clone(), &params).unwrap());
        });
    }
    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("Forest query");
    let index = ApproximateIndex::build(entries(100_000), 10).unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    let queries = random_codes(&mut rng, 100);
    for k in [10, 50] {
        group.bench_with_input(BenchmarkId::from_parameter(k), &k, |b, &k| {
            b.iter(|| queries.iter().map(|q| index.query(q, black_box(k)).len()).sum::<usize>());
        });
    }
    group.finish();
}

fn bench_refine(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(2);
    let query = random_codes(&mut rng, 1000);
    let candidate = ImageRecord::new(ImageId(1), "bench", random_codes(&mut rng, 1000));
    let params = RefineParams::default();
    c.bench_function("refine 1000x1000", |b| {
        b.iter(|| refine(&query, &candidate, &params).unwrap());
    });
}

criterion_group!(benches, bench_build, bench_query, bench_refine);
criterion_main!(benches);
