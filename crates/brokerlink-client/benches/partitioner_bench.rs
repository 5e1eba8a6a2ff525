//! Partitioner Benchmarks
//!
//! ## Benchmarks
//!
//! ### 1. Key Hashing (`bench_key_hashing`)
//! - SipHash partition selection for keys of different lengths
//!
//! ### 2. Round Robin (`bench_round_robin`)
//! - Unkeyed selection through the shared atomic counter
//!
//! ## Running
//!
//! ```bash
//! cargo bench -p brokerlink-client --bench partitioner_bench
//! ```

use brokerlink_client::partitioner::hash_partition;
use brokerlink_client::Partitioner;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn bench_key_hashing(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_hashing");

    for key_size in [8, 64, 512] {
        let key = vec![b'k'; key_size];
        group.throughput(Throughput::Bytes(key_size as u64));
        group.bench_with_input(BenchmarkId::new("bytes", key_size), &key, |b, key| {
            b.iter(|| black_box(hash_partition(black_box(key), 12)));
        });
    }

    group.finish();
}

fn bench_round_robin(c: &mut Criterion) {
    let partitioner = Partitioner::new();
    c.bench_function("round_robin", |b| {
        b.iter(|| black_box(partitioner.select("orders", None, None, 12).unwrap()));
    });
}

criterion_group!(benches, bench_key_hashing, bench_round_robin);
criterion_main!(benches);
