//! Benchmark suite for lfhash table operations.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lfhash::{LfHash, LfHashBuilder};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

/// 8-byte key followed by an 8-byte value.
fn element(i: u64) -> [u8; 16] {
    let mut element = [0; 16];
    element[..8].copy_from_slice(&i.to_le_bytes());
    element[8..].copy_from_slice(&(!i).to_le_bytes());
    element
}

fn new_table() -> LfHash {
    LfHash::new(16, 0, 8).unwrap()
}

/// Benchmark insertion of new elements into an empty table, starting from a
/// single bucket so that growth is included.
fn insert_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    for size in [100u64, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*size));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let table = new_table();
                let mut pins = table.pins().unwrap();
                for i in 0..size {
                    table.insert(&mut pins, black_box(&element(i))).unwrap();
                }
            });
        });
    }
    group.finish();
}

/// Benchmark lookups on a pre-populated table.
fn search_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");

    for size in [100u64, 1_000, 10_000].iter() {
        let table = new_table();
        let mut pins = table.pins().unwrap();
        for i in 0..*size {
            table.insert(&mut pins, &element(i)).unwrap();
        }

        group.throughput(Throughput::Elements(*size));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                for i in 0..size {
                    let found = table.search(&mut pins, black_box(&i.to_le_bytes()));
                    black_box(found.map(|f| f[8]));
                }
            });
        });
    }
    group.finish();
}

/// Benchmark insert and delete of the same keys, which recycles records
/// through the pool.
fn churn_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("churn");

    for size in [100u64, 1_000].iter() {
        let table = LfHashBuilder::new(16)
            .key(0, 8)
            .initial_buckets(*size as u32)
            .build()
            .unwrap();
        let mut pins = table.pins().unwrap();

        group.throughput(Throughput::Elements(*size * 2));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                for i in 0..size {
                    table.insert(&mut pins, black_box(&element(i))).unwrap();
                }
                for i in 0..size {
                    table.delete(&mut pins, black_box(&i.to_le_bytes())).unwrap();
                }
            });
        });
    }
    group.finish();
}

/// Benchmark mixed operations from several threads on a shared table.
///
/// Distribution per thread: 25% inserts, 25% deletes, 50% searches.
fn concurrent_mixed_benchmark(c: &mut Criterion) {
    const OPS_PER_THREAD: u64 = 10_000;
    let mut group = c.benchmark_group("concurrent_mixed");

    for num_threads in [2u64, 4, 8].iter() {
        group.throughput(Throughput::Elements(num_threads * OPS_PER_THREAD));
        group.bench_with_input(
            BenchmarkId::from_parameter(num_threads),
            num_threads,
            |b, &num_threads| {
                b.iter(|| {
                    let table = Arc::new(new_table());
                    let barrier = Arc::new(Barrier::new(num_threads as usize));

                    let threads: Vec<_> = (0..num_threads)
                        .map(|t| {
                            let table = Arc::clone(&table);
                            let barrier = Arc::clone(&barrier);
                            thread::spawn(move || {
                                let mut pins = table.pins().unwrap();
                                barrier.wait();
                                for i in 0..OPS_PER_THREAD {
                                    let key = (i * 7 + t) % 1_024;
                                    match i % 4 {
                                        0 => {
                                            let _ = table.insert(&mut pins, &element(key));
                                        }
                                        1 => {
                                            let _ = table.delete(&mut pins, &key.to_le_bytes());
                                        }
                                        _ => {
                                            black_box(table.contains(&mut pins, &key.to_le_bytes()));
                                        }
                                    }
                                }
                            })
                        })
                        .collect();

                    for t in threads {
                        t.join().unwrap();
                    }
                });
            },
        );
    }
    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(50);
    targets = insert_benchmark, search_benchmark, churn_benchmark, concurrent_mixed_benchmark
}

criterion_main!(benches);
