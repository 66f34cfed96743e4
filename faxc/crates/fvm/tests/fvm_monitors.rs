//! Monitor Lifecycle Tests - Inflation, Deflation, Registry Conservation
//!
//! These tests verify the monitor registry through real lock traffic:
//! - concurrent inflation of one object publishes exactly one monitor
//! - idle monitors deflate at safepoints and restore the object header
//! - every carved monitor stays accounted for on exactly one list
//! - thread-local provisioning grows as configured

mod common;

use common::{
    assert_audit_clean, assert_neutral, wait_until, RuntimeFixture, TEST_TIMEOUT,
};
use fvm::logging::VmEvent;
use fvm::object::LockState;
use fvm::runtime::MaintenanceOperation;
use fvm::{InflateCause, LockRecord, ManagedObject, VmConfig, WaitStatus};
use std::collections::HashSet;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

/// ============================================================================
/// INFLATION
/// ============================================================================

/// **Bug this finds:** two inflaters both publishing a monitor
/// **Invariant verified:** K racing inflations of one stack-locked object
/// observe the same monitor and exactly one inflation is recorded
#[test]
fn test_concurrent_inflation_publishes_one_monitor() {
    let fixture = RuntimeFixture::with_defaults();
    let runtime = &fixture.runtime;
    let object = ManagedObject::new_ref();
    let racers = 6;
    let barrier = Barrier::new(racers);
    let addresses = Mutex::new(HashSet::new());

    let holder = runtime.attach_thread("holder").unwrap();
    let record = pin!(LockRecord::new());
    holder.enter(&object, record.as_ref()).unwrap();

    thread::scope(|s| {
        for i in 0..racers {
            let (object, barrier, addresses) = (&object, &barrier, &addresses);
            s.spawn(move || {
                let mutator = runtime.attach_thread(format!("racer-{}", i)).unwrap();
                barrier.wait();
                let monitor = mutator.inflate(object).unwrap();
                addresses.lock().unwrap().insert(monitor);
            });
        }
    });

    assert_eq!(addresses.lock().unwrap().len(), 1);
    assert_eq!(runtime.stats().inflations(InflateCause::VmInternal), 1);
    assert_eq!(runtime.synchronizer().registry().in_use_count(), 1);
    assert_eq!(holder.current_owner(&object), Some(holder.id()));

    holder.exit(&object, record.as_ref()).unwrap();
    holder.submit(Arc::new(MaintenanceOperation)).unwrap();

    assert_neutral(&object, "after deflation");
    assert_eq!(runtime.synchronizer().registry().in_use_count(), 0);
    drop(holder);
    assert_audit_clean(runtime, "after inflation race");
}

/// ============================================================================
/// DEFLATION
/// ============================================================================

/// **Invariant verified:** deflation leaves busy monitors alone and frees
/// idle ones, restoring the displaced header
#[test]
fn test_deflation_skips_busy_monitors() {
    let fixture = RuntimeFixture::with_defaults();
    let runtime = &fixture.runtime;
    let mutator = runtime.attach_thread("main").unwrap();

    let idle = ManagedObject::new_ref();
    let held = ManagedObject::new_ref();
    let idle_hash = mutator.identity_hash(&idle).unwrap();

    mutator.inflate(&idle).unwrap();
    let record = pin!(LockRecord::new());
    mutator.enter(&held, record.as_ref()).unwrap();
    mutator.inflate(&held).unwrap();

    mutator.submit(Arc::new(MaintenanceOperation)).unwrap();

    assert_neutral(&idle, "idle object");
    assert_eq!(idle.lock_word().hash(), idle_hash);
    assert_eq!(held.lock_state(), LockState::Inflated);
    assert_eq!(runtime.stats().deflations(), 1);
    assert_eq!(
        fixture.count_events(|e| matches!(e, VmEvent::DeflationPass { deflated: 1, .. })),
        1
    );

    mutator.exit(&held, record.as_ref()).unwrap();
    mutator.submit(Arc::new(MaintenanceOperation)).unwrap();
    assert_neutral(&held, "released object");
    assert_eq!(runtime.synchronizer().registry().in_use_count(), 0);
}

/// A deflated object can be locked and inflated again
#[test]
fn test_relock_after_deflation() {
    let fixture = RuntimeFixture::with_defaults();
    let mutator = fixture.runtime.attach_thread("main").unwrap();
    let object = ManagedObject::new_ref();

    for _ in 0..3 {
        mutator.inflate(&object).unwrap();
        let record = pin!(LockRecord::new());
        mutator.enter(&object, record.as_ref()).unwrap();
        mutator.exit(&object, record.as_ref()).unwrap();
        mutator.submit(Arc::new(MaintenanceOperation)).unwrap();
        assert_neutral(&object, "after round");
    }

    assert_eq!(fixture.runtime.stats().deflations(), 3);
    drop(mutator);
    assert_audit_clean(&fixture.runtime, "after relock rounds");
}

/// ============================================================================
/// CONSERVATION
/// ============================================================================

/// **Bug this finds:** monitors leaking when a thread detaches with monitors
/// on its private lists
#[test]
fn test_detach_flushes_thread_lists() {
    let fixture = RuntimeFixture::with_config(VmConfig {
        guaranteed_safepoint_interval_ms: 0,
        monitor_block_size: 16,
        monitor_initial_provision: 4,
        verify_monitors: true,
        fatal_policy: fvm::FatalPolicy::Intercept,
        ..Default::default()
    });
    let runtime = &fixture.runtime;
    let objects: Vec<_> = (0..5).map(|_| ManagedObject::new_ref()).collect();

    thread::scope(|s| {
        for chunk in objects.chunks(2) {
            s.spawn(move || {
                let mutator = runtime.attach_thread("inflater").unwrap();
                for object in chunk {
                    mutator.inflate(object).unwrap();
                }
                assert_eq!(mutator.thread().monitors().in_use_count(), chunk.len());
            });
        }
    });

    let registry = runtime.synchronizer().registry();
    assert_eq!(registry.in_use_count(), objects.len());
    assert_eq!(registry.global_in_use_count(), objects.len());

    let report = runtime.audit_monitors().unwrap();
    assert!(report.is_ok(), "{:?}", report.errors);
    assert_eq!(report.thread_free.walked + report.thread_in_use.walked, 0);
    assert_eq!(report.total_walked(), report.population);

    runtime.request_cleanup().unwrap();
    assert_eq!(registry.in_use_count(), 0);
    for object in &objects {
        assert_neutral(object, "after cleanup");
    }
    assert_audit_clean(runtime, "after cleanup");
}

/// **Invariant verified:** the first refill moves a whole batch and the batch
/// grows by `1 + batch / 2`
#[test]
fn test_thread_provision_grows() {
    let fixture = RuntimeFixture::with_config(VmConfig {
        guaranteed_safepoint_interval_ms: 0,
        monitor_block_size: 64,
        monitor_initial_provision: 4,
        monitor_max_provision: 8,
        ..Default::default()
    });
    let mutator = fixture.runtime.attach_thread("main").unwrap();
    let cache = mutator.thread().monitors();
    assert_eq!(cache.provision(), 4);

    mutator.inflate(&ManagedObject::new_ref()).unwrap();
    assert_eq!(cache.free_count(), 3);
    assert_eq!(cache.in_use_count(), 1);
    assert_eq!(cache.provision(), 7);
    assert_eq!(fixture.runtime.synchronizer().registry().population(), 63);

    for _ in 0..3 {
        mutator.inflate(&ManagedObject::new_ref()).unwrap();
    }
    mutator.inflate(&ManagedObject::new_ref()).unwrap();
    assert_eq!(cache.free_count(), 6);
    assert_eq!(cache.provision(), 8);
}

/// ============================================================================
/// END-TO-END
/// ============================================================================

/// Hash, stack-lock, contended enter, wait/notify, then a forced maintenance
/// safepoint deflates the monitor
///
/// **Invariant verified:** after forced deflation the lock word is neutral
/// again and still carries the identity hash installed at the start
#[test]
fn test_lock_lifecycle_with_forced_deflation() {
    let fixture = RuntimeFixture::with_fast_maintenance(20);
    let runtime = &fixture.runtime;
    let object = ManagedObject::new_ref();
    let locked = AtomicBool::new(false);
    let hash = Mutex::new(0u32);

    thread::scope(|s| {
        s.spawn(|| {
            let mutator = runtime.attach_thread("a").unwrap();
            *hash.lock().unwrap() = mutator.identity_hash(&object).unwrap();

            let record = pin!(LockRecord::new());
            mutator.enter(&object, record.as_ref()).unwrap();
            assert_eq!(object.lock_state(), LockState::StackLocked);
            locked.store(true, Ordering::SeqCst);

            assert_eq!(mutator.wait(&object, 0).unwrap(), WaitStatus::Notified);
            mutator.exit(&object, record.as_ref()).unwrap();
        });

        s.spawn(|| {
            let mutator = runtime.attach_thread("b").unwrap();
            assert!(wait_until(TEST_TIMEOUT, || locked.load(Ordering::SeqCst)));

            // a's wait inflates its own stack lock: StackLocked -> Inflating -> Inflated
            assert!(
                wait_until(TEST_TIMEOUT, || object.lock_state() == LockState::Inflated),
                "wait never inflated the stack lock"
            );

            let record = pin!(LockRecord::new());
            mutator.enter(&object, record.as_ref()).unwrap();
            mutator.notify(&object).unwrap();
            mutator.exit(&object, record.as_ref()).unwrap();
        });
    });

    assert!(
        wait_until(TEST_TIMEOUT, || object.lock_state() == LockState::Neutral),
        "forced safepoint never deflated the monitor"
    );
    assert_eq!(object.lock_word().hash(), *hash.lock().unwrap());
    assert_eq!(
        fixture.count_events(|e| matches!(e, VmEvent::Inflated { cause, .. } if cause == "wait")),
        1
    );
    assert_eq!(runtime.stats().inflations(InflateCause::Wait), 1);
    assert!(runtime.stats().forced_safepoints() >= 1);
    assert!(fixture.count_events(|e| matches!(e, VmEvent::ForcedSafepoint { .. })) >= 1);
    assert_audit_clean(runtime, "after forced deflation");
}
