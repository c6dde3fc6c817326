//! # Quantum-Sync Wire Benchmarks
//!
//! | Path | Work per update |
//! |------|-----------------|
//! | checksum | hash the new value once |
//! | diff | one structural diff against the cached value |
//! | encode | one full frame (compressed past the threshold) |
//! | alias | rewrite the id of a cached frame per subscriber |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use qs_wire::frame::{encode_subscription_data, with_id};
use qs_wire::{apply_patch, diff, fingerprint, hash_json, OutgoingFrame, Payload};
use serde_json::{json, Value};

fn rows(n: usize, generation: usize) -> Value {
    Value::Array(
        (0..n)
            .map(|i| {
                json!({
                    "id": i,
                    "name": format!("row-{i}"),
                    "score": if i % 10 == 0 { generation } else { i },
                    "tags": ["alpha", "beta"],
                })
            })
            .collect(),
    )
}

fn bench_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum");
    for size in [10, 100, 1000] {
        let value = rows(size, 0);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("hash_json", size), &value, |b, v| {
            b.iter(|| black_box(hash_json(v)))
        });
    }
    let payload = Payload::from(json!({"region": "eu-west", "limit": 50}));
    group.bench_function("fingerprint", |b| {
        b.iter(|| black_box(fingerprint("region", &payload)))
    });
    group.finish();
}

fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff");
    for size in [10, 100, 1000] {
        let old = rows(size, 0);
        let new = rows(size, 1);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("diff", size), &(&old, &new), |b, (o, n)| {
            b.iter(|| black_box(diff(o, n)))
        });
        let patch = diff(&old, &new);
        group.bench_with_input(BenchmarkId::new("apply", size), &(&old, &patch), |b, (o, p)| {
            b.iter(|| black_box(apply_patch(o, p).unwrap()))
        });
    }
    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for size in [1, 100, 1000] {
        let payload = Payload::from(rows(size, 0));
        group.bench_with_input(BenchmarkId::new("subscription_data", size), &payload, |b, p| {
            b.iter(|| black_box(encode_subscription_data(7, 42, p).unwrap()))
        });
        let frame = encode_subscription_data(7, 42, &payload).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", size), &frame, |b, f| {
            b.iter(|| black_box(OutgoingFrame::decode_all(f).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("alias", size), &frame, |b, f| {
            b.iter(|| black_box(with_id(f, 99).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_checksum, bench_diff, bench_encode);
criterion_main!(benches);
