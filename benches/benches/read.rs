use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use watch_stm::{atomically, TVar};

pub fn criterion_benchmark(c: &mut Criterion) {
    // Atomic load time
    let at_bool = black_box(AtomicBool::new(false));
    let at_u32 = black_box(AtomicU32::new(21123));
    let mx_u32 = black_box(Mutex::new(21123_u32));

    let mut ref1 = c.benchmark_group("baseline-load");
    ref1.bench_function("atomic-bool", |b| {
        b.iter(|| black_box(at_bool.load(Ordering::Relaxed)))
    });
    ref1.bench_function("atomic-u32", |b| {
        b.iter(|| black_box(at_u32.load(Ordering::Relaxed)))
    });
    ref1.bench_function("mutex-u32", |b| {
        b.iter(|| black_box(*mx_u32.lock().unwrap()))
    });
    ref1.finish();

    // TVar load time, with and without a transaction
    let tv_bool = black_box(TVar::new(false));
    let tv_u32 = black_box(TVar::new(21123_u32));

    let mut g1 = c.benchmark_group("tvar-load");
    g1.bench_function("bool", |b| b.iter(|| black_box(tv_bool.read_atomic())));
    g1.bench_function("u32", |b| b.iter(|| black_box(tv_u32.read_atomic())));
    g1.bench_function("u32-transactional", |b| {
        b.iter(|| black_box(atomically(|tx| tv_u32.read(tx))))
    });
    g1.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
