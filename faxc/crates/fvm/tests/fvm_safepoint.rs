//! Safepoint and Operation Queue Tests
//!
//! These tests verify the coordinator protocol end to end:
//! - operations execute exactly once and release their submitter
//! - queued safepoint operations coalesce into one pause
//! - threads in native code never hold up a safepoint
//! - nesting and lifecycle errors

mod common;

use common::{wait_until, RuntimeFixture, TEST_TIMEOUT};
use fvm::logging::VmEvent;
use fvm::runtime::MaintenanceOperation;
use fvm::object::LockState;
use fvm::{
    FnOperation, FvmError, LockRecord, ManagedObject, Runtime, RuntimeState, ThreadState, VmConfig,
};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// ============================================================================
/// EXECUTION
/// ============================================================================

/// **Bug this finds:** duplicate execution or a submitter released early
/// **Invariant verified:** one execution per submission; the submitter's
/// completed count equals its issued count whenever `submit` returns
#[test]
fn test_exactly_once_and_ticket_arithmetic() {
    let fixture = RuntimeFixture::with_defaults();
    let mutator = fixture.runtime.attach_thread("submitter").unwrap();
    let executions = Arc::new(AtomicUsize::new(0));

    for round in 1..=3u64 {
        let op = {
            let executions = Arc::clone(&executions);
            FnOperation::safepoint("count", move |ctx| {
                assert!(ctx.is_at_safepoint());
                executions.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        mutator.submit(op.into_arc()).unwrap();

        let tickets = mutator.thread().tickets();
        assert_eq!(executions.load(Ordering::SeqCst), round as usize);
        assert_eq!(tickets.issued(), round);
        assert_eq!(tickets.completed(), round);
        assert_eq!(mutator.state(), ThreadState::InManaged);
    }

    assert_eq!(fixture.runtime.stats().safepoints(), 3);
    assert_eq!(fixture.runtime.stats().pause_times().count(), 3);
}

/// **Bug this finds:** an attached thread submitting through `Runtime` and
/// waiting while still counted as running, so the safepoint never starts
#[test]
fn test_runtime_submit_from_attached_thread() {
    let fixture = RuntimeFixture::with_defaults();
    let mutator = fixture.runtime.attach_thread("attached-caller").unwrap();
    let ran = Arc::new(AtomicBool::new(false));

    let op = {
        let ran = Arc::clone(&ran);
        FnOperation::safepoint("from-runtime", move |_| {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        })
    };
    fixture.runtime.submit(op.into_arc()).unwrap();

    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(mutator.thread().tickets().completed(), 1);
    assert_eq!(mutator.state(), ThreadState::InManaged);
    assert!(!fixture.runtime.is_failed());
}

#[test]
fn test_ordinary_operation_does_not_stop_the_world() {
    let fixture = RuntimeFixture::with_defaults();
    let ran = Arc::new(AtomicBool::new(false));

    let op = {
        let ran = Arc::clone(&ran);
        FnOperation::ordinary("background", move |ctx| {
            assert!(!ctx.is_at_safepoint());
            ran.store(true, Ordering::SeqCst);
            Ok(())
        })
    };
    fixture.runtime.submit(op.into_arc()).unwrap();

    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(fixture.safepoint_begins(), 0);
}

/// Operation errors reach the submitter unchanged
#[test]
fn test_operation_error_is_returned() {
    let fixture = RuntimeFixture::with_defaults();
    let op = FnOperation::safepoint("failing", |_| {
        Err(FvmError::illegal_lock("op", "rejected by body"))
    });

    let err = fixture.runtime.submit(op.into_arc()).unwrap_err();
    assert!(matches!(err, FvmError::IllegalLockState { .. }));
    assert!(!fixture.runtime.is_failed());
}

/// ============================================================================
/// COALESCING
/// ============================================================================

/// **Bug this finds:** one pause per operation instead of one per batch
/// **Invariant verified:** 5 queued safepoint operations run inside exactly
/// one safepoint begin/end pair
#[test]
fn test_queued_safepoint_operations_coalesce() {
    let fixture = RuntimeFixture::with_defaults();
    let runtime = &fixture.runtime;
    let blocking = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let executed = Arc::new(AtomicUsize::new(0));
    let submitters = 5;

    thread::scope(|s| {
        // Keeps the coordinator busy while the batch queues up
        s.spawn(|| {
            let blocker = {
                let (blocking, release) = (Arc::clone(&blocking), Arc::clone(&release));
                FnOperation::ordinary("blocker", move |_| {
                    blocking.store(true, Ordering::SeqCst);
                    while !release.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(1));
                    }
                    Ok(())
                })
            };
            runtime.submit(blocker.into_arc()).unwrap();
        });

        assert!(wait_until(TEST_TIMEOUT, || blocking.load(Ordering::SeqCst)));

        for i in 0..submitters {
            let executed = Arc::clone(&executed);
            s.spawn(move || {
                let mutator = runtime.attach_thread(format!("submitter-{}", i)).unwrap();
                let op = FnOperation::safepoint(format!("op-{}", i), move |ctx| {
                    assert!(ctx.is_at_safepoint());
                    executed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                mutator.submit(op.into_arc()).unwrap();
            });
        }

        assert!(wait_until(TEST_TIMEOUT, || runtime.pending_operations() == submitters));
        release.store(true, Ordering::SeqCst);
    });

    assert_eq!(executed.load(Ordering::SeqCst), submitters);
    assert_eq!(fixture.safepoint_begins(), 1);
    assert_eq!(fixture.safepoint_ends(), 1);
    assert_eq!(
        fixture.count_events(|e| matches!(e, VmEvent::SafepointEnd { operations: 5, .. })),
        1
    );
    assert_eq!(runtime.stats().safepoints(), 1);
}

/// ============================================================================
/// THREAD STATES
/// ============================================================================

/// **Invariant verified:** a thread in native code counts as safe and cannot
/// return to managed code until the safepoint ends
#[test]
fn test_native_thread_does_not_block_safepoint() {
    let fixture = RuntimeFixture::with_defaults();
    let in_native = AtomicBool::new(false);
    let leave = AtomicBool::new(false);
    let returned = AtomicBool::new(false);
    let in_operation = Arc::new(AtomicBool::new(false));
    let finish = Arc::new(AtomicBool::new(false));

    thread::scope(|s| {
        s.spawn(|| {
            let mut mutator = fixture.runtime.attach_thread("native").unwrap();
            {
                let scope = mutator.enter_native();
                assert_eq!(scope.handle().state(), ThreadState::InNativeWalkable);
                in_native.store(true, Ordering::SeqCst);
                while !leave.load(Ordering::SeqCst) {
                    thread::yield_now();
                }
            }
            returned.store(true, Ordering::SeqCst);
        });

        assert!(wait_until(TEST_TIMEOUT, || in_native.load(Ordering::SeqCst)));

        s.spawn(|| {
            let op = {
                let (in_operation, finish) = (Arc::clone(&in_operation), Arc::clone(&finish));
                FnOperation::safepoint("hold", move |_| {
                    in_operation.store(true, Ordering::SeqCst);
                    while !finish.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(1));
                    }
                    Ok(())
                })
            };
            fixture.runtime.submit(op.into_arc()).unwrap();
        });

        assert!(wait_until(TEST_TIMEOUT, || in_operation.load(Ordering::SeqCst)));
        leave.store(true, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert!(!returned.load(Ordering::SeqCst), "left native during a safepoint");

        finish.store(true, Ordering::SeqCst);
        assert!(wait_until(TEST_TIMEOUT, || returned.load(Ordering::SeqCst)));
    });
}

/// **Bug this finds:** a thread in native code changing lock words while it
/// is counted as stopped
/// **Invariant verified:** locking from native code waits for the safepoint
/// to end, and the thread is back in native code afterwards
#[test]
fn test_native_thread_cannot_lock_during_safepoint() {
    let fixture = RuntimeFixture::with_defaults();
    let object = ManagedObject::new_ref();
    let in_native = AtomicBool::new(false);
    let locked = AtomicBool::new(false);
    let in_operation = Arc::new(AtomicBool::new(false));
    let attempting = Arc::new(AtomicBool::new(false));
    let observed: Arc<Mutex<Option<LockState>>> = Arc::new(Mutex::new(None));

    thread::scope(|s| {
        s.spawn(|| {
            let mut mutator = fixture.runtime.attach_thread("native-locker").unwrap();
            let record = pin!(LockRecord::new());
            let scope = mutator.enter_native();
            in_native.store(true, Ordering::SeqCst);

            assert!(wait_until(TEST_TIMEOUT, || in_operation.load(Ordering::SeqCst)));
            attempting.store(true, Ordering::SeqCst);
            scope.handle().enter(&object, record.as_ref()).unwrap();
            locked.store(true, Ordering::SeqCst);

            assert_eq!(scope.handle().state(), ThreadState::InNativeWalkable);
            assert_eq!(object.lock_state(), LockState::StackLocked);
            scope.handle().exit(&object, record.as_ref()).unwrap();
        });

        assert!(wait_until(TEST_TIMEOUT, || in_native.load(Ordering::SeqCst)));

        let op = {
            let (in_operation, attempting, observed, object) = (
                Arc::clone(&in_operation),
                Arc::clone(&attempting),
                Arc::clone(&observed),
                Arc::clone(&object),
            );
            FnOperation::safepoint("watch-lock", move |_| {
                in_operation.store(true, Ordering::SeqCst);
                assert!(wait_until(TEST_TIMEOUT, || attempting.load(Ordering::SeqCst)));
                thread::sleep(Duration::from_millis(30));
                *observed.lock().unwrap() = Some(object.lock_state());
                Ok(())
            })
        };
        fixture.runtime.submit(op.into_arc()).unwrap();
    });

    assert_eq!(*observed.lock().unwrap(), Some(LockState::Neutral));
    assert!(locked.load(Ordering::SeqCst));
    assert_eq!(object.lock_state(), LockState::Neutral);
}

/// ============================================================================
/// NESTING
/// ============================================================================

#[test]
fn test_nested_operation_runs_inline() {
    let fixture = RuntimeFixture::with_defaults();
    let inner_ran = Arc::new(AtomicBool::new(false));

    let outer = {
        let inner_ran = Arc::clone(&inner_ran);
        FnOperation::safepoint("outer", move |ctx| {
            let id = ctx.safepoint_id();
            let inner = {
                let inner_ran = Arc::clone(&inner_ran);
                FnOperation::safepoint("inner", move |inner_ctx| {
                    assert!(inner_ctx.is_at_safepoint());
                    assert_eq!(inner_ctx.safepoint_id(), id);
                    inner_ran.store(true, Ordering::SeqCst);
                    Ok(())
                })
            };
            ctx.execute_nested(inner.into_arc())
        })
        .allowing_nested()
    };

    fixture.runtime.submit(outer.into_arc()).unwrap();
    assert!(inner_ran.load(Ordering::SeqCst));
    assert_eq!(fixture.safepoint_begins(), 1);
}

/// **Bug this finds:** an operation re-entering the coordinator and deadlocking
#[test]
fn test_illegal_nesting_is_fatal() {
    let fixture = RuntimeFixture::with_defaults();

    let outer = FnOperation::safepoint("outer", |ctx| {
        ctx.execute_nested(FnOperation::safepoint("inner", |_| Ok(())).into_arc())
    });

    let err = fixture.runtime.submit(outer.into_arc()).unwrap_err();
    assert!(matches!(err.root_cause(), FvmError::NestedOperation { .. }));
    assert!(fixture.runtime.is_failed());
    assert!(matches!(
        fixture.runtime.request_cleanup(),
        Err(FvmError::FatalProtocolViolation(_))
    ));
}

/// ============================================================================
/// LIFECYCLE
/// ============================================================================

#[test]
fn test_submit_requires_running_runtime() {
    let runtime = Runtime::new(VmConfig::default()).unwrap();
    assert_eq!(runtime.state(), RuntimeState::Initialized);
    assert!(matches!(
        runtime.submit(Arc::new(MaintenanceOperation)),
        Err(FvmError::InvalidState { .. })
    ));

    runtime.start().unwrap();
    runtime.submit(Arc::new(MaintenanceOperation)).unwrap();
    assert!(runtime.start().is_err());

    runtime.stop().unwrap();
    assert_eq!(runtime.state(), RuntimeState::Stopped);
    assert!(matches!(
        runtime.submit(Arc::new(MaintenanceOperation)),
        Err(FvmError::Shutdown)
    ));
    assert!(matches!(
        runtime.attach_thread("late"),
        Err(FvmError::Shutdown)
    ));
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = VmConfig {
        monitor_block_size: 1,
        ..Default::default()
    };
    assert!(matches!(
        Runtime::new(config),
        Err(FvmError::Configuration(_))
    ));
}
