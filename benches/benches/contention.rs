use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::{Arc, Mutex};
use std::thread;

use watch_stm::{atomically, guard, TVar};

const THREADS: usize = 8;
const INCREMENTS: i64 = 100;

fn increment_tvar() {
    let x = TVar::new(0_i64);
    let threads: Vec<_> = (0..THREADS)
        .map(|_| {
            let x = x.clone();
            thread::spawn(move || {
                for _ in 0..INCREMENTS {
                    atomically(|tx| x.modify(tx, |v| v + 1));
                }
            })
        })
        .collect();

    // block until all increments are in
    atomically(|tx| guard(x.read(tx)? == (THREADS as i64) * INCREMENTS));
    for t in threads {
        t.join().unwrap();
    }
}

fn increment_mutex() {
    let x = Arc::new(Mutex::new(0_i64));
    let threads: Vec<_> = (0..THREADS)
        .map(|_| {
            let x = x.clone();
            thread::spawn(move || {
                for _ in 0..INCREMENTS {
                    *x.lock().unwrap() += 1;
                }
            })
        })
        .collect();

    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(*x.lock().unwrap(), (THREADS as i64) * INCREMENTS);
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended-increment");
    group.sample_size(10);
    group.bench_function("tvar", |b| b.iter(increment_tvar));
    group.bench_function("mutex", |b| b.iter(increment_mutex));
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
