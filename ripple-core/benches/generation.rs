//! Benchmark: generation planning for recompute batches
//!
//! Every `Recompute` wave layers its batch with `GenerationPlan::build`.
//! Batches after a popular variable changes can hold hundreds of ids, each
//! with a subtree covering most of the others, so this is the quadratic
//! corner of the cascade.

use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ripple_core::graph::GenerationPlan;
use ripple_core::EntityId;

/// A chain `c0 → c1 → ... → c{n-1}`, every link requested.
fn chain(n: usize) -> (Vec<EntityId>, HashMap<EntityId, Vec<EntityId>>) {
    let ids: Vec<EntityId> = (0..n).map(|i| EntityId::computed(format!("c{i}"))).collect();
    let subtrees = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), ids[i + 1..].to_vec()))
        .collect();
    (ids, subtrees)
}

/// `n` independent rooms each fed by one computed.
fn fan(n: usize) -> (Vec<EntityId>, HashMap<EntityId, Vec<EntityId>>) {
    let mut ids = Vec::with_capacity(n * 2);
    let mut subtrees = HashMap::new();
    for i in 0..n {
        let computed = EntityId::computed(format!("c{i}"));
        let room = EntityId::room(format!("r{i}"));
        subtrees.insert(computed.clone(), vec![room.clone()]);
        ids.push(room);
        ids.push(computed);
    }
    (ids, subtrees)
}

fn bench_generation_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("generation_plan");

    for n in [16usize, 128, 512] {
        group.throughput(Throughput::Elements(n as u64));

        let (ids, subtrees) = chain(n);
        group.bench_with_input(BenchmarkId::new("chain", n), &n, |b, _| {
            b.iter(|| black_box(GenerationPlan::build(&ids, &subtrees)));
        });

        let (ids, subtrees) = fan(n);
        group.bench_with_input(BenchmarkId::new("fan", n), &n, |b, _| {
            b.iter(|| black_box(GenerationPlan::build(&ids, &subtrees)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_generation_plan);
criterion_main!(benches);
