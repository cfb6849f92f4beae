//! Benchmarks for heapwarden.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use heapwarden::{LibcHeap, RawHeap, Tracker, TrackerConfig};
use std::sync::{Arc, Barrier};
use std::thread;

fn bench_single_thread(c: &mut Criterion) {
    let tracker = Tracker::new(LibcHeap, TrackerConfig::default());
    let guarded = Tracker::new(LibcHeap, TrackerConfig::strict());

    let mut group = c.benchmark_group("allocate_release");

    for size in [16usize, 256, 4096] {
        group.throughput(Throughput::Elements(1));

        group.bench_with_input(BenchmarkId::new("raw", size), &size, |b, &size| {
            b.iter(|| {
                let p = LibcHeap.raw_allocate(black_box(size)).unwrap();
                unsafe { LibcHeap.raw_release(black_box(p)) };
            })
        });

        group.bench_with_input(BenchmarkId::new("tracked", size), &size, |b, &size| {
            b.iter(|| {
                let p = tracker.allocate(black_box(size));
                unsafe { tracker.release(black_box(p).as_ptr()) };
            })
        });

        group.bench_with_input(BenchmarkId::new("strict", size), &size, |b, &size| {
            b.iter(|| {
                let p = guarded.allocate(black_box(size));
                unsafe { guarded.release(black_box(p).as_ptr()) };
            })
        });
    }

    group.finish();
}

fn bench_resize(c: &mut Criterion) {
    let tracker = Tracker::new(LibcHeap, TrackerConfig::default());

    c.bench_function("resize_grow_16_to_4096", |b| {
        b.iter(|| unsafe {
            let p = tracker.allocate(16);
            let q = tracker.resize(p.as_ptr(), black_box(4096));
            tracker.release(q.as_ptr());
        })
    });
}

fn bench_multi_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_thread");
    const OPS: usize = 10_000;

    for threads in [2usize, 4, 8] {
        group.throughput(Throughput::Elements((threads * OPS) as u64));
        group.bench_with_input(BenchmarkId::new("tracked", threads), &threads, |b, &threads| {
            let tracker = Arc::new(Tracker::new(LibcHeap, TrackerConfig::default()));
            b.iter(|| {
                let barrier = Arc::new(Barrier::new(threads));
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let tracker = Arc::clone(&tracker);
                        let barrier = Arc::clone(&barrier);
                        thread::spawn(move || {
                            barrier.wait();
                            for i in 0..OPS {
                                let p = tracker.allocate(16 + (i & 127));
                                unsafe { tracker.release(black_box(p).as_ptr()) };
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap();
                }
            })
        });
    }

    group.finish();
}

fn bench_cross_thread_release(c: &mut Criterion) {
    let tracker = Arc::new(Tracker::new(LibcHeap, TrackerConfig::default()));

    c.bench_function("cross_thread_release_1000", |b| {
        b.iter(|| {
            let addrs: Vec<usize> = (0..1000).map(|_| tracker.allocate(64).as_ptr() as usize).collect();
            let releaser = Arc::clone(&tracker);
            thread::spawn(move || {
                for addr in addrs {
                    unsafe { releaser.release(addr as *mut u8) };
                }
            })
            .join()
            .unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_single_thread,
    bench_resize,
    bench_multi_thread,
    bench_cross_thread_release,
);
criterion_main!(benches);
