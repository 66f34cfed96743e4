//! FVM Lock Benchmarks
//!
//! Measures the uncontended enter/exit paths.
//! Run with: `cargo bench --package fvm`

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fvm::{LockRecord, ManagedObject, Runtime, VmConfig};
use std::pin::pin;

fn create_runtime() -> Runtime {
    let config = VmConfig {
        guaranteed_safepoint_interval_ms: 0,
        verify_monitors: false,
        ..Default::default()
    };
    Runtime::with_config(config).unwrap()
}

fn bench_stack_lock(c: &mut Criterion) {
    let runtime = create_runtime();
    let mutator = runtime.attach_thread("bench").unwrap();
    let object = ManagedObject::new_ref();

    let mut group = c.benchmark_group("stack_lock");

    group.bench_function("enter_exit", |b| {
        b.iter(|| {
            let record = pin!(LockRecord::new());
            mutator.enter(black_box(&object), record.as_ref()).unwrap();
            mutator.exit(black_box(&object), record.as_ref()).unwrap();
        })
    });

    group.bench_function("recursive_enter_exit", |b| {
        let outer = pin!(LockRecord::new());
        mutator.enter(&object, outer.as_ref()).unwrap();
        b.iter(|| {
            let record = pin!(LockRecord::new());
            mutator.enter(black_box(&object), record.as_ref()).unwrap();
            mutator.exit(black_box(&object), record.as_ref()).unwrap();
        });
        mutator.exit(&object, outer.as_ref()).unwrap();
    });

    group.finish();
}

fn bench_inflated_lock(c: &mut Criterion) {
    let runtime = create_runtime();
    let mutator = runtime.attach_thread("bench").unwrap();
    let object = ManagedObject::new_ref();
    mutator.inflate(&object).unwrap();

    let mut group = c.benchmark_group("inflated_lock");

    group.bench_function("enter_exit", |b| {
        b.iter(|| {
            let record = pin!(LockRecord::new());
            mutator.enter(black_box(&object), record.as_ref()).unwrap();
            mutator.exit(black_box(&object), record.as_ref()).unwrap();
        })
    });

    group.bench_function("identity_hash", |b| {
        b.iter(|| black_box(mutator.identity_hash(&object).unwrap()))
    });

    group.finish();
}

fn bench_poll(c: &mut Criterion) {
    let runtime = create_runtime();
    let mutator = runtime.attach_thread("bench").unwrap();

    c.bench_function("safepoint_poll_disarmed", |b| b.iter(|| mutator.poll()));
}

criterion_group!(benches, bench_stack_lock, bench_inflated_lock, bench_poll);
criterion_main!(benches);
