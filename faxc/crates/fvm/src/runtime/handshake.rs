//! Handshake Mechanism
//!
//! Runs a closure against one thread (or each thread) without stopping the
//! world. Per target:
//!
//! ```text
//! Idle ──arm (Release)──▶ Armed ──claim token, disarm──▶ Executing ──▶ Idle
//! ```
//!
//! Either the target (at its next poll) or the coordinator may execute. The
//! coordinator must first see the target in a safe state, claim the target's
//! token without blocking, and see the safe state again while holding it.
//! The slot is disarmed *before* the closure runs, so `has_pending_handshake`
//! is false for the whole execution.
//!
//! A thread leaving a safe state takes the token once, so it cannot resume
//! managed code while the coordinator is executing on its behalf.

use super::operation::{OperationContext, VmOperation};
use crate::error::{FvmError, Result};
use crate::logging::{VmEvent, VmLogger};
use crate::stats::{VmStats, VmTimer};
use crate::thread::MutatorThread;
use crate::util::SpinWait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Closure run by a handshake
pub type HandshakeFn = dyn Fn(&MutatorThread) + Send + Sync;

/// One handshake, shared by all of its targets
pub struct Handshake {
    name: String,
    closure: Box<HandshakeFn>,
    pending: AtomicUsize,
    executed: AtomicUsize,
    skipped: AtomicUsize,
}

impl Handshake {
    pub fn new<F>(name: impl Into<String>, closure: F) -> Self
    where
        F: Fn(&MutatorThread) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            closure: Box::new(closure),
            pending: AtomicUsize::new(0),
            executed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::Acquire)
    }

    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::Acquire)
    }

    fn run(&self, thread: &MutatorThread, by_self: bool, stats: &VmStats, logger: &VmLogger) {
        (self.closure)(thread);
        self.executed.fetch_add(1, Ordering::AcqRel);
        stats.record_handshake(by_self);
        logger.log(VmEvent::HandshakeExecuted {
            operation: self.name.clone(),
            thread: thread.id().as_u64(),
            by_self,
        });
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    fn skip(&self, stats: &VmStats) {
        self.skipped.fetch_add(1, Ordering::AcqRel);
        stats.record_handshake_skipped();
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .field("executed", &self.executed())
            .field("skipped", &self.skipped())
            .finish()
    }
}

/// Per-thread handshake slot
pub struct HandshakeSlot {
    /// Armed handshake, one leaked `Arc` strong count while non-null
    operation: AtomicPtr<Handshake>,
    /// Execution token shared by the thread and the coordinator
    token: Mutex<()>,
}

impl HandshakeSlot {
    pub fn new() -> Self {
        Self {
            operation: AtomicPtr::new(std::ptr::null_mut()),
            token: Mutex::new(()),
        }
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        !self.operation.load(Ordering::Acquire).is_null()
    }

    /// Install `handshake`; false if another one is still armed
    pub(crate) fn arm(&self, handshake: &Arc<Handshake>) -> bool {
        let raw = Arc::into_raw(Arc::clone(handshake)) as *mut Handshake;
        match self.operation.compare_exchange(
            std::ptr::null_mut(),
            raw,
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => true,
            Err(_) => {
                // SAFETY: `raw` was produced above and never published.
                drop(unsafe { Arc::from_raw(raw as *const Handshake) });
                false
            }
        }
    }

    /// Disarm, taking the armed handshake; callers hold the token
    fn disarm(&self) -> Option<Arc<Handshake>> {
        let raw = self.operation.swap(std::ptr::null_mut(), Ordering::AcqRel);
        // SAFETY: non-null values come from `arm`, and the swap hands the
        // leaked count to exactly one caller.
        (!raw.is_null()).then(|| unsafe { Arc::from_raw(raw as *const Handshake) })
    }

    /// Target side: run an armed handshake on the current thread
    pub(crate) fn process_by_self(&self, thread: &MutatorThread, stats: &VmStats, logger: &VmLogger) {
        if !self.is_armed() {
            return;
        }
        let _token = self.token.lock();
        if let Some(handshake) = self.disarm() {
            handshake.run(thread, true, stats, logger);
        }
    }

    /// Coordinator side: run the armed handshake if `thread` is provably safe
    ///
    /// Returns whether this call processed the slot.
    pub(crate) fn try_process_by_coordinator(
        &self,
        thread: &MutatorThread,
        stats: &VmStats,
        logger: &VmLogger,
    ) -> bool {
        if !self.is_armed() || !thread.is_safe_for_global_operation() {
            return false;
        }

        let Some(_token) = self.token.try_lock() else {
            return false;
        };

        if !thread.is_safe_for_global_operation() {
            return false;
        }

        let Some(handshake) = self.disarm() else {
            return false;
        };

        if thread.is_terminated() {
            handshake.skip(stats);
        } else {
            handshake.run(thread, false, stats, logger);
        }
        true
    }

    /// Wait out an execution the coordinator is running for this thread
    pub(crate) fn wait_until_idle(&self) {
        drop(self.token.lock());
    }
}

impl Default for HandshakeSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HandshakeSlot {
    fn drop(&mut self) {
        drop(self.disarm());
    }
}

/// Counts from one handshake round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub executed: usize,
    pub skipped: usize,
}

/// Arm `handshake` in every target and drive it to completion
///
/// Runs on the coordinator thread.
pub(crate) fn execute(
    handshake: &Arc<Handshake>,
    targets: &[Arc<MutatorThread>],
    timeout: Option<Duration>,
    stats: &VmStats,
    logger: &VmLogger,
) -> Result<HandshakeOutcome> {
    let timer = VmTimer::new();

    // Only this thread arms slots, so a slot seen idle here stays idle until
    // armed below. A leftover armed slot means an earlier round never finished.
    if let Some(busy) = targets
        .iter()
        .find(|t| !t.is_terminated() && t.has_pending_handshake())
    {
        log::warn!(
            "[VM] Handshake '{}': thread {} still has an earlier handshake armed",
            handshake.name,
            busy.id()
        );
        return Err(still_armed(handshake, busy));
    }

    handshake.pending.store(targets.len(), Ordering::Release);

    let mut armed = Vec::with_capacity(targets.len());
    for target in targets {
        if target.is_terminated() {
            handshake.skip(stats);
        } else if target.handshake().arm(handshake) {
            armed.push(target);
        } else {
            return Err(still_armed(handshake, target));
        }
    }

    let mut spin = SpinWait::new();
    while handshake.pending() > 0 {
        let mut progressed = false;
        for target in &armed {
            progressed |= target
                .handshake()
                .try_process_by_coordinator(target, stats, logger);
        }

        if handshake.pending() == 0 {
            break;
        }

        if let Some(limit) = timeout {
            if timer.elapsed() >= limit {
                let pending_threads = armed
                    .iter()
                    .filter(|t| t.has_pending_handshake())
                    .map(|t| t.id())
                    .collect();
                return Err(FvmError::ProtocolTimeout {
                    protocol: "handshake",
                    elapsed_ms: timer.elapsed_ms(),
                    pending_threads,
                });
            }
        }

        if progressed {
            spin.reset();
        } else {
            spin.snooze();
        }
    }

    let outcome = HandshakeOutcome {
        executed: handshake.executed(),
        skipped: handshake.skipped(),
    };
    logger.log(VmEvent::HandshakeCompleted {
        operation: handshake.name.clone(),
        executed: outcome.executed,
        skipped: outcome.skipped,
        duration_us: timer.elapsed_us(),
    });
    Ok(outcome)
}

fn still_armed(handshake: &Handshake, target: &MutatorThread) -> FvmError {
    FvmError::InvariantViolation(format!(
        "cannot arm handshake '{}': thread {} has another handshake armed",
        handshake.name,
        target.id()
    ))
}

// ============================================================================
// HANDSHAKE AS A VM OPERATION
// ============================================================================

/// Which threads a handshake operation targets
pub(crate) enum HandshakeTargets {
    Single(Arc<MutatorThread>),
    All,
}

/// Ordinary operation that drives one handshake from the coordinator
pub(crate) struct HandshakeOperation {
    handshake: Arc<Handshake>,
    targets: HandshakeTargets,
    outcome: Mutex<Option<HandshakeOutcome>>,
}

impl HandshakeOperation {
    pub(crate) fn new(handshake: Handshake, targets: HandshakeTargets) -> Self {
        Self {
            handshake: Arc::new(handshake),
            targets,
            outcome: Mutex::new(None),
        }
    }

    /// Counts recorded by the coordinator, once evaluated
    pub(crate) fn outcome(&self) -> HandshakeOutcome {
        self.outcome.lock().unwrap_or_default()
    }
}

impl VmOperation for HandshakeOperation {
    fn name(&self) -> &str {
        self.handshake.name()
    }

    fn evaluate(&self, ctx: &OperationContext<'_>) -> Result<()> {
        let shared = ctx.shared();
        let targets = match &self.targets {
            HandshakeTargets::Single(thread) => vec![Arc::clone(thread)],
            HandshakeTargets::All => shared.threads.snapshot(),
        };

        let outcome = execute(
            &self.handshake,
            &targets,
            shared.config.handshake_timeout(),
            &shared.stats,
            &shared.logger,
        )?;
        *self.outcome.lock() = Some(outcome);
        Ok(())
    }

    fn evaluate_at_safepoint(&self) -> bool {
        false
    }
}
