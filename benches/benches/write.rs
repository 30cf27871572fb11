use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use watch_stm::{atomically, TVar};

pub fn criterion_benchmark(c: &mut Criterion) {
    // Atomic store time
    let at_bool = black_box(AtomicBool::new(false));
    let at_u32 = black_box(AtomicU32::new(21123));
    let mx_u32 = black_box(Mutex::new(21123_u32));

    let mut ref1 = c.benchmark_group("baseline-store");
    ref1.bench_function("atomic-bool", |b| {
        b.iter(|| {
            at_bool.store(black_box(true), Ordering::Relaxed);
            black_box(&at_bool)
        })
    });
    ref1.bench_function("atomic-u32", |b| {
        b.iter(|| {
            at_u32.store(black_box(21424), Ordering::Relaxed);
            black_box(&at_u32)
        })
    });
    ref1.bench_function("mutex-u32", |b| {
        b.iter(|| {
            *mx_u32.lock().unwrap() = black_box(21424);
            black_box(&mx_u32)
        })
    });
    ref1.finish();

    // TVar store time, with and without a transaction
    let tv_bool = black_box(TVar::new(false));
    let tv_u32 = black_box(TVar::new(21123_u32));

    let mut g1 = c.benchmark_group("tvar-store");
    g1.bench_function("bool-atomic", |b| {
        b.iter(|| {
            tv_bool.write_atomic(black_box(true));
            black_box(&tv_bool)
        })
    });
    g1.bench_function("u32-atomic", |b| {
        b.iter(|| {
            tv_u32.write_atomic(black_box(21424));
            black_box(&tv_u32)
        })
    });
    g1.bench_function("u32-transactional", |b| {
        b.iter(|| {
            atomically(|trans| tv_u32.write(trans, black_box(21424)));
            black_box(&tv_u32)
        })
    });
    g1.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
