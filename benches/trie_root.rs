//! Root recomputation benchmarks.
//!
//! Measures batched insertion plus parallel Merkle-ID recomputation at
//! several batch sizes, over both an empty database and a pre-populated one
//! (the latter exercises edge splitting against committed state).
//!
//! ```bash
//! cargo bench --bench trie_root
//! ```
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use std::sync::Arc;

use layerdb::{BranchFactor, Config, LayerDb, MemStore, ViewChanges};

/// Random 20-byte keys with 32-byte values, the shape of account updates.
fn gen_batch(len: usize, rng: &mut StdRng) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
    (0..len)
        .map(|_| {
            let key: [u8; 20] = rng.gen();
            let value: [u8; 32] = rng.gen();
            (key.to_vec(), Some(value.to_vec()))
        })
        .collect()
}

fn fresh_db() -> Arc<LayerDb<MemStore>> {
    LayerDb::new(MemStore::new(BranchFactor::Sixteen), Config::default())
        .expect("fresh database")
}

fn bench_root_from_empty(c: &mut Criterion) {
    let mut group = c.benchmark_group("root_from_empty");
    for size in [100usize, 1_000, 10_000] {
        let mut rng = StdRng::seed_from_u64(size as u64);
        let batch = gen_batch(size, &mut rng);
        group.bench_function(format!("{size}_keys"), |b| {
            b.iter_batched(
                || (fresh_db(), batch.clone()),
                |(db, batch)| {
                    let view = db
                        .new_view(ViewChanges::from_batch(batch))
                        .expect("view");
                    black_box(view.merkle_root().expect("root"));
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_incremental_update(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    let db = fresh_db();
    let base = db
        .new_view(ViewChanges::from_batch(gen_batch(50_000, &mut rng)))
        .expect("base view");
    base.commit_to_db().expect("commit base");

    let mut group = c.benchmark_group("incremental_update");
    for size in [100usize, 1_000] {
        let batch = gen_batch(size, &mut rng);
        group.bench_function(format!("{size}_of_50k"), |b| {
            b.iter_batched(
                || batch.clone(),
                |batch| {
                    let view = db
                        .new_view(ViewChanges::from_batch(batch))
                        .expect("view");
                    black_box(view.merkle_root().expect("root"));
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_root_from_empty, bench_incremental_update);
criterion_main!(benches);
