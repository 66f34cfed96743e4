//! Test Utilities for the FVM Test Suite
//!
//! Shared fixture and assertions for the integration tests. Every fixture
//! runs its own `Runtime`; nothing is process-wide.

#![allow(dead_code)]

use fvm::logging::VmEvent;
use fvm::object::LockState;
use fvm::{FatalPolicy, ManagedObject, Runtime, VmConfig};
use std::time::{Duration, Instant};

/// Maximum time a test waits for an asynchronous condition
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// ============================================================================
/// RUNTIME FIXTURE
/// ============================================================================

/// Test fixture owning a started runtime
///
/// Dropping the fixture stops the runtime and frees every monitor block.
pub struct RuntimeFixture {
    pub runtime: Runtime,
    pub config: VmConfig,
}

impl RuntimeFixture {
    /// Defaults with forced safepoints disabled and audits on
    ///
    /// **Bug this finds:** initialization and coordinator start-up failures
    pub fn with_defaults() -> Self {
        Self::with_config(VmConfig {
            guaranteed_safepoint_interval_ms: 0,
            verify_monitors: true,
            fatal_policy: FatalPolicy::Intercept,
            ..Default::default()
        })
    }

    pub fn with_config(config: VmConfig) -> Self {
        let runtime = Runtime::with_config(config.clone())
            .expect("runtime should start with a valid config");
        Self { runtime, config }
    }

    /// Small monitor blocks and a short guaranteed interval
    pub fn with_fast_maintenance(interval_ms: u64) -> Self {
        Self::with_config(VmConfig {
            guaranteed_safepoint_interval_ms: interval_ms,
            monitor_usage_deflation_threshold_pct: 1,
            monitor_block_size: 2,
            monitor_initial_provision: 1,
            verify_monitors: true,
            fatal_policy: FatalPolicy::Intercept,
            ..Default::default()
        })
    }

    /// Short protocol deadlines, fatal errors returned instead of aborting
    pub fn intercepting(timeout_ms: u64) -> Self {
        Self::with_config(VmConfig {
            guaranteed_safepoint_interval_ms: 0,
            safepoint_timeout_ms: timeout_ms,
            handshake_timeout_ms: timeout_ms,
            fatal_policy: FatalPolicy::Intercept,
            ..Default::default()
        })
    }

    pub fn count_events<F>(&self, pred: F) -> usize
    where
        F: Fn(&VmEvent) -> bool,
    {
        self.runtime.logger().count_matching(pred)
    }

    pub fn safepoint_begins(&self) -> usize {
        self.count_events(|e| matches!(e, VmEvent::SafepointBegin { .. }))
    }

    pub fn safepoint_ends(&self) -> usize {
        self.count_events(|e| matches!(e, VmEvent::SafepointEnd { .. }))
    }
}

/// ============================================================================
/// ASSERTIONS
/// ============================================================================

/// Poll `cond` until it holds or `timeout` passes
pub fn wait_until<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Assert the object is unlocked and carries no monitor
pub fn assert_neutral(object: &ManagedObject, context: &str) {
    assert_eq!(
        object.lock_state(),
        LockState::Neutral,
        "{}: expected a neutral lock word, got {:?}",
        context,
        object.lock_word()
    );
}

/// Run the monitor audit in a safepoint and assert it is clean
///
/// Call only while no attached thread is running managed code without
/// polling.
///
/// **Invariant verified:** every carved monitor is on exactly one list and
/// every recorded count matches its list
pub fn assert_audit_clean(runtime: &Runtime, context: &str) {
    let report = runtime.audit_monitors().expect("audit operation should run");
    assert!(
        report.is_ok(),
        "{}: monitor audit failed: {:?}",
        context,
        report.errors
    );
    assert_eq!(
        report.total_walked(),
        report.population,
        "{}: monitors lost or duplicated",
        context
    );
}
