use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;
use tandem_core::{Op, Replica, StateVector};

const PARAGRAPH: &str = "The quick brown fox jumps over the lazy dog. ";

fn typed_document(chars: usize) -> (Replica, Vec<Op>) {
    let mut replica = Replica::random();
    let mut ops = Vec::with_capacity(chars);
    while replica.len() < chars {
        let end = replica.len();
        ops.extend(replica.insert(end, PARAGRAPH).unwrap());
    }
    (replica, ops)
}

fn bench_local_typing(c: &mut Criterion) {
    let mut group = c.benchmark_group("Replica");
    group.throughput(Throughput::Elements(1));

    group.bench_function("type_char_at_end", |b| {
        let (mut replica, _) = typed_document(2_000);
        b.iter(|| {
            let end = replica.len();
            black_box(replica.insert(end, black_box("x")).unwrap());
        })
    });

    group.bench_function("type_char_mid_document", |b| {
        let (mut replica, _) = typed_document(2_000);
        b.iter(|| {
            let mid = replica.len() / 2;
            black_box(replica.insert(mid, black_box("x")).unwrap());
        })
    });

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("Replica");
    let (_, ops) = typed_document(2_000);
    group.throughput(Throughput::Elements(ops.len() as u64));

    group.bench_function("merge_in_order", |b| {
        b.iter(|| {
            let mut dest = Replica::random();
            black_box(dest.merge(ops.iter().cloned()));
        })
    });

    let reversed: Vec<Op> = ops.iter().rev().take(200).cloned().collect();
    group.bench_function("merge_200_reversed", |b| {
        b.iter(|| {
            let mut dest = Replica::random();
            black_box(dest.merge(reversed.iter().cloned()));
        })
    });

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("Replica");
    let (replica, _) = typed_document(10_000);

    group.bench_function("snapshot_10k", |b| b.iter(|| black_box(replica.snapshot())));
    group.bench_function("encode_state_10k", |b| {
        b.iter(|| black_box(replica.encode_state().unwrap()))
    });
    group.bench_function("delta_since_empty_10k", |b| {
        let empty = StateVector::new();
        b.iter(|| black_box(replica.delta_since(&empty)))
    });

    group.finish();
}

criterion_group!(benches, bench_local_typing, bench_merge, bench_snapshot);
criterion_main!(benches);
