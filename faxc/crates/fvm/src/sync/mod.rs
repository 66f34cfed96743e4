//! Sync Module - Object Lock State Machine
//!
//! Lock word transitions:
//!
//! ```text
//!   Neutral ──enter──▶ Stack-locked(record) ──inflate──▶ Inflating ──▶ Inflated(monitor)
//!      ▲                    │ exit                                          │
//!      └────────────────────┘                 deflate (safepoint only) ◀───┘
//! ```
//!
//! - Stack locks cost one CAS and no allocation; the owner remembers the
//!   record in its fixed-size `LockStack`. A thread whose lock stack is full
//!   takes the monitor path instead.
//! - The entry points are crate-private: `MutatorHandle` moves its thread
//!   into managed code before calling them, so no lock word changes while a
//!   safepoint is in progress.
//! - Inflation from a stack lock installs the `INFLATING` sentinel first;
//!   exactly one thread wins that CAS, every other thread spins until the
//!   monitor address is published.
//! - A losing inflater returns its speculative monitor to its own free list.
//! - Deflation restores the monitor's header (including an identity hash)
//!   into the object and recycles the monitor.

use crate::error::{FvmError, Result};
use crate::fatal::FatalHandler;
use crate::logging::{VmEvent, VmLogger};
use crate::monitor::{AuditReport, DeflationReport, MonitorRegistry, ObjectMonitor};
use crate::object::lock_word::normalize_hash;
use crate::object::{Decoded, LockRecord, LockWord, ManagedObject, ObjectRef};
use crate::runtime::safepoint::Safepoint;
use crate::stats::{VmStats, VmTimer};
use crate::thread::{MutatorThread, ThreadId, ThreadList};
use crate::util::SpinWait;
use rand::Rng;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub use crate::monitor::WaitStatus;

/// Why a lock was inflated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InflateCause {
    MonitorEnter = 0,
    Wait = 1,
    Notify = 2,
    HashCode = 3,
    VmInternal = 4,
}

impl InflateCause {
    pub const COUNT: usize = 5;

    pub fn name(self) -> &'static str {
        match self {
            InflateCause::MonitorEnter => "monitor_enter",
            InflateCause::Wait => "wait",
            InflateCause::Notify => "notify",
            InflateCause::HashCode => "hash_code",
            InflateCause::VmInternal => "vm_internal",
        }
    }
}

impl std::fmt::Display for InflateCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// ObjectSynchronizer - enter/exit/wait/notify over lock words
pub struct ObjectSynchronizer {
    registry: MonitorRegistry,
    safepoint: Arc<Safepoint>,
    threads: Arc<ThreadList>,
    stats: Arc<VmStats>,
    logger: Arc<VmLogger>,
    fatal: Arc<FatalHandler>,
    deflation_threshold_pct: u8,
    verify_monitors: bool,
}

impl ObjectSynchronizer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: MonitorRegistry,
        safepoint: Arc<Safepoint>,
        threads: Arc<ThreadList>,
        stats: Arc<VmStats>,
        logger: Arc<VmLogger>,
        fatal: Arc<FatalHandler>,
        deflation_threshold_pct: u8,
        verify_monitors: bool,
    ) -> Self {
        Self {
            registry,
            safepoint,
            threads,
            stats,
            logger,
            fatal,
            deflation_threshold_pct,
            verify_monitors,
        }
    }

    pub fn registry(&self) -> &MonitorRegistry {
        &self.registry
    }

    /// Reborrow a monitor named by an inflated lock word
    #[inline]
    fn monitor_at(&self, monitor: *const ObjectMonitor) -> &ObjectMonitor {
        // SAFETY: inflated lock words only ever point into registry blocks,
        // which live as long as `self.registry`.
        unsafe { &*monitor }
    }

    /// Current lock word, waiting out a concurrent inflation
    fn stable_word(&self, object: &ManagedObject) -> LockWord {
        let mut spin = SpinWait::new();
        loop {
            let word = object.lock_word();
            if word != LockWord::INFLATING {
                return word;
            }
            spin.snooze();
        }
    }

    fn allocate(&self, thread: &MutatorThread) -> Result<&ObjectMonitor> {
        self.registry
            .allocate(thread.monitors())
            .map_err(|err| self.fatal.handle(err))
    }

    fn release(&self, thread: &MutatorThread, monitor: &ObjectMonitor) -> Result<()> {
        self.registry
            .release(thread.monitors(), monitor)
            .map_err(|err| self.fatal.handle(err))
    }

    // ========================================================================
    // ENTER / EXIT
    // ========================================================================

    /// Acquire `object`'s lock for `thread`
    ///
    /// `record` must stay pinned and alive until the matching `exit`.
    pub(crate) fn enter(
        &self,
        thread: &MutatorThread,
        object: &ObjectRef,
        record: Pin<&LockRecord>,
    ) -> Result<()> {
        let me = thread.id();
        let address = record.address();
        record.set_owner(me);

        let word = object.lock_word();
        match word.decode() {
            Decoded::Neutral { .. } if !thread.lock_stack().is_full() => {
                record.set_displaced_header(word);
                if object
                    .cas_lock_word(word, LockWord::stack_locked(address))
                    .is_ok()
                {
                    let pushed = thread.push_lock_record(address);
                    debug_assert!(pushed, "lock stack filled by another thread");
                    return Ok(());
                }
            }
            Decoded::StackLocked { record: held } if thread.owns_lock_record(held) => {
                record.set_displaced_header(LockWord::RECURSIVE);
                return Ok(());
            }
            _ => {}
        }

        record.set_displaced_header(LockWord::UNUSED);
        let monitor = self.inflate(thread, object, InflateCause::MonitorEnter)?;
        if monitor.try_enter(me) {
            return Ok(());
        }

        monitor.add_contender();
        self.safepoint
            .blocked(thread, || monitor.enter_contended(me));
        Ok(())
    }

    /// Release one level of `object`'s lock
    pub(crate) fn exit(
        &self,
        thread: &MutatorThread,
        object: &ObjectRef,
        record: Pin<&LockRecord>,
    ) -> Result<()> {
        let me = thread.id();
        let displaced = record.displaced_header();

        if displaced == LockWord::RECURSIVE {
            let owned = match self.stable_word(object).decode() {
                Decoded::StackLocked { record: held } => thread.owns_lock_record(held),
                Decoded::Inflated { monitor } => self.monitor_at(monitor).is_owned_by(me),
                _ => false,
            };
            crate::ensure_owner!(owned, "exit", "thread {} does not own the lock", me);
            record.set_displaced_header(LockWord::UNUSED);
            return Ok(());
        }

        let address = record.address();
        loop {
            let word = self.stable_word(object);
            match word.decode() {
                Decoded::Neutral { .. } => {
                    return Err(FvmError::illegal_lock("exit", "object is not locked"));
                }
                Decoded::StackLocked { record: held } if held == address => {
                    if object.cas_lock_word(word, displaced).is_ok() {
                        thread.remove_lock_record(address);
                        record.set_displaced_header(LockWord::UNUSED);
                        return Ok(());
                    }
                    // inflated underneath us; retry on the monitor
                }
                Decoded::StackLocked { .. } => {
                    return Err(FvmError::illegal_lock(
                        "exit",
                        format!("thread {} does not hold the lock through this record", me),
                    ));
                }
                Decoded::Inflated { monitor } => {
                    self.monitor_at(monitor).exit(me)?;
                    if displaced.is_neutral() {
                        thread.remove_lock_record(address);
                    }
                    record.set_displaced_header(LockWord::UNUSED);
                    return Ok(());
                }
                Decoded::Inflating => {}
            }
        }
    }

    // ========================================================================
    // WAIT / NOTIFY
    // ========================================================================

    /// Monitor of an object `thread` must own, inflating its own stack lock
    fn owned_monitor(
        &self,
        thread: &MutatorThread,
        object: &ObjectRef,
        operation: &'static str,
        cause: InflateCause,
    ) -> Result<&ObjectMonitor> {
        let me = thread.id();
        let monitor = match self.stable_word(object).decode() {
            Decoded::Neutral { .. } => {
                return Err(FvmError::illegal_lock(operation, "object is not locked"));
            }
            Decoded::StackLocked { record } if thread.owns_lock_record(record) => {
                self.inflate(thread, object, cause)?
            }
            Decoded::StackLocked { .. } => {
                return Err(FvmError::illegal_lock(
                    operation,
                    format!("object is stack-locked by another thread, not {}", me),
                ));
            }
            Decoded::Inflated { monitor } => self.monitor_at(monitor),
            Decoded::Inflating => self.inflate(thread, object, cause)?,
        };

        crate::ensure_owner!(
            monitor.is_owned_by(me),
            operation,
            "thread {} does not own the lock",
            me
        );
        Ok(monitor)
    }

    /// Wait on `object` for at most `timeout_ms` (0 = forever)
    pub(crate) fn wait(
        &self,
        thread: &MutatorThread,
        object: &ObjectRef,
        timeout_ms: u64,
    ) -> Result<WaitStatus> {
        let monitor = self.owned_monitor(thread, object, "wait", InflateCause::Wait)?;
        let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
        let me = thread.id();
        self.safepoint
            .blocked(thread, || monitor.wait(me, timeout))
    }

    pub(crate) fn notify(&self, thread: &MutatorThread, object: &ObjectRef) -> Result<()> {
        match self.notify_target(thread, object, "notify")? {
            Some(monitor) => monitor.notify(thread.id()),
            None => Ok(()),
        }
    }

    pub(crate) fn notify_all(&self, thread: &MutatorThread, object: &ObjectRef) -> Result<()> {
        match self.notify_target(thread, object, "notify_all")? {
            Some(monitor) => monitor.notify_all(thread.id()),
            None => Ok(()),
        }
    }

    /// `None` when `thread` holds a stack lock: nobody can be waiting
    fn notify_target(
        &self,
        thread: &MutatorThread,
        object: &ObjectRef,
        operation: &'static str,
    ) -> Result<Option<&ObjectMonitor>> {
        match self.stable_word(object).decode() {
            Decoded::StackLocked { record } if thread.owns_lock_record(record) => Ok(None),
            _ => self
                .owned_monitor(thread, object, operation, InflateCause::Notify)
                .map(Some),
        }
    }

    // ========================================================================
    // IDENTITY HASH AND OWNERSHIP
    // ========================================================================

    /// Stable identity hash of `object`, installing one if needed
    pub(crate) fn identity_hash(&self, thread: &MutatorThread, object: &ObjectRef) -> Result<u32> {
        loop {
            let word = self.stable_word(object);
            match word.decode() {
                Decoded::Neutral { hash } if hash != 0 => return Ok(hash),
                Decoded::Neutral { .. } => {
                    let hash = generate_hash();
                    if object.cas_lock_word(word, word.with_hash(hash)).is_ok() {
                        return Ok(hash);
                    }
                    continue;
                }
                Decoded::StackLocked { record } if thread.owns_lock_record(record) => {
                    // SAFETY: our own stack lock; the record outlives it.
                    let displaced = unsafe { LockRecord::from_address(record) }.displaced_header();
                    if displaced.has_hash() {
                        return Ok(displaced.hash());
                    }
                }
                Decoded::Inflated { monitor } => {
                    return Ok(self.monitor_hash(self.monitor_at(monitor)));
                }
                _ => {}
            }

            let monitor = self.inflate(thread, object, InflateCause::HashCode)?;
            return Ok(self.monitor_hash(monitor));
        }
    }

    fn monitor_hash(&self, monitor: &ObjectMonitor) -> u32 {
        loop {
            let header = monitor.header();
            if header.has_hash() {
                return header.hash();
            }
            let hash = generate_hash();
            if monitor.cas_header(header, header.with_hash(hash)).is_ok() {
                return hash;
            }
        }
    }

    /// Thread currently owning `object`'s lock (diagnostics; may be stale)
    pub fn current_owner(&self, object: &ManagedObject) -> Option<ThreadId> {
        match self.stable_word(object).decode() {
            Decoded::StackLocked { record } => self
                .threads
                .snapshot()
                .iter()
                .find(|t| t.owns_lock_record(record))
                .map(|t| t.id()),
            Decoded::Inflated { monitor } => self.monitor_at(monitor).owner(),
            Decoded::Neutral { .. } | Decoded::Inflating => None,
        }
    }

    // ========================================================================
    // INFLATION / DEFLATION
    // ========================================================================

    /// Bind a monitor to `object`, or return the one already bound
    pub(crate) fn inflate(
        &self,
        thread: &MutatorThread,
        object: &ObjectRef,
        cause: InflateCause,
    ) -> Result<&ObjectMonitor> {
        let mut spin = SpinWait::new();

        loop {
            let word = object.lock_word();
            match word.decode() {
                Decoded::Inflated { monitor } => return Ok(self.monitor_at(monitor)),

                Decoded::Inflating => spin.snooze(),

                Decoded::StackLocked { record } => {
                    let monitor = self.allocate(thread)?;
                    if object.cas_lock_word(word, LockWord::INFLATING).is_err() {
                        self.release(thread, monitor)?;
                        continue;
                    }

                    // SAFETY: while the sentinel is installed the owner cannot
                    // complete its exit, so the record is still live.
                    let stack_lock = unsafe { LockRecord::from_address(record) };
                    monitor.set_header(stack_lock.displaced_header());
                    if let Some(owner) = stack_lock.owner() {
                        monitor.set_owner(owner);
                    }
                    monitor.bind(object);
                    object.store_lock_word(LockWord::inflated(monitor));

                    self.inflated(thread, object, monitor, cause);
                    return Ok(monitor);
                }

                Decoded::Neutral { .. } => {
                    let monitor = self.allocate(thread)?;
                    monitor.set_header(word);
                    monitor.bind(object);

                    if object
                        .cas_lock_word(word, LockWord::inflated(monitor))
                        .is_err()
                    {
                        drop(monitor.unbind());
                        self.release(thread, monitor)?;
                        continue;
                    }

                    self.inflated(thread, object, monitor, cause);
                    return Ok(monitor);
                }
            }
        }
    }

    fn inflated(
        &self,
        thread: &MutatorThread,
        object: &ManagedObject,
        monitor: &ObjectMonitor,
        cause: InflateCause,
    ) {
        self.registry.register_in_use(thread.monitors(), monitor);
        self.stats.record_inflation(cause);
        self.logger.log(VmEvent::Inflated {
            object: object.address(),
            monitor: monitor.address(),
            cause: cause.name().to_string(),
        });
    }

    /// Unbind one monitor if it is idle
    fn deflate_monitor(&self, monitor: &ObjectMonitor) -> Result<bool> {
        let Some(object) = monitor.bound_object() else {
            return Err(FvmError::InvariantViolation(format!(
                "unbound monitor {} on an in-use list",
                crate::util::format_address(monitor.address())
            )));
        };

        if monitor.is_busy() {
            return Ok(false);
        }

        if object.lock_word() != LockWord::inflated(monitor) {
            return Err(FvmError::InvariantViolation(format!(
                "object {} does not point at its monitor {}",
                crate::util::format_address(object.address()),
                crate::util::format_address(monitor.address())
            )));
        }

        object.store_lock_word(monitor.header());
        drop(monitor.unbind());
        monitor.reset();
        Ok(true)
    }

    /// Deflate every idle monitor; only legal inside a safepoint
    pub(crate) fn deflate_idle_monitors(&self, threads: &[Arc<MutatorThread>]) -> Result<DeflationReport> {
        if !self.safepoint.is_synchronized() {
            return Err(FvmError::InvalidState {
                expected: "synchronized safepoint".to_string(),
                actual: self.safepoint.state().to_string(),
            });
        }

        let timer = VmTimer::new();
        let report = self
            .registry
            .deflate_idle(threads, |monitor| self.deflate_monitor(monitor))?;

        self.stats.record_deflation_pass(report.deflated);
        self.logger.log(VmEvent::DeflationPass {
            scanned: report.scanned,
            deflated: report.deflated,
            duration_us: timer.elapsed_us(),
        });

        if self.verify_monitors {
            self.registry.audit(threads).into_result()?;
        }
        Ok(report)
    }

    /// Whether enough monitors are in use to force a maintenance safepoint
    pub fn is_cleanup_needed(&self) -> bool {
        self.registry
            .is_cleanup_needed(self.deflation_threshold_pct)
    }

    pub fn audit(&self, threads: &[Arc<MutatorThread>]) -> AuditReport {
        self.registry.audit(threads)
    }
}

fn generate_hash() -> u32 {
    normalize_hash(rand::thread_rng().gen::<u32>())
}
