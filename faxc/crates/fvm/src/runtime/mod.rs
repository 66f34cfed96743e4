//! Runtime Module - Coordinator, Operations and Mutator Handles
//!
//! A `Runtime` owns one coordinator thread, the thread list, the monitor
//! registry and the operation queue. Application threads attach to it and
//! get a `MutatorHandle`, through which they lock objects, poll for
//! safepoints and submit operations.
//!
//! # Example
//!
//! ```rust,no_run
//! use fvm::{ManagedObject, LockRecord, Runtime, VmConfig};
//! use std::pin::pin;
//!
//! let runtime = Runtime::with_config(VmConfig::default()).unwrap();
//! let mut mutator = runtime.attach_thread("main").unwrap();
//!
//! let object = ManagedObject::new_ref();
//! let record = pin!(LockRecord::new());
//! mutator.enter(&object, record.as_ref()).unwrap();
//! mutator.exit(&object, record.as_ref()).unwrap();
//!
//! mutator.detach();
//! runtime.stop().unwrap();
//! ```

pub mod coordinator;
pub mod handshake;
pub mod operation;
pub mod queue;
pub mod safepoint;

pub use handshake::{Handshake, HandshakeOutcome, HandshakeSlot};
pub use operation::{
    FnOperation, MaintenanceOperation, OperationContext, OperationKind, TicketBox, VmOperation,
};
pub use safepoint::{Safepoint, SafepointState, SyncReport};

use crate::config::VmConfig;
use crate::error::{FvmError, Result};
use crate::fatal::FatalHandler;
use crate::logging::VmLogger;
use crate::monitor::{AuditReport, MonitorRegistry};
use crate::object::{LockRecord, ManagedObject, ObjectRef};
use crate::stats::VmStats;
use crate::sync::{InflateCause, ObjectSynchronizer, WaitStatus};
use crate::thread::{MutatorThread, ThreadId, ThreadIdAllocator, ThreadList, ThreadState};
use coordinator::CurrentOperation;
use handshake::{HandshakeOperation, HandshakeTargets};
use parking_lot::{Condvar, Mutex};
use queue::{OperationQueue, QueuedOperation};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Runtime lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RuntimeState {
    Initialized = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl RuntimeState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RuntimeState::Initialized,
            1 => RuntimeState::Running,
            2 => RuntimeState::Stopping,
            _ => RuntimeState::Stopped,
        }
    }
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RuntimeState::Initialized => "initialized",
            RuntimeState::Running => "running",
            RuntimeState::Stopping => "stopping",
            RuntimeState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

// ============================================================================
// SHARED STATE
// ============================================================================

/// State shared between the runtime, its handles and the coordinator
pub(crate) struct RuntimeShared {
    pub(crate) config: VmConfig,
    state: AtomicU8,
    pub(crate) threads: Arc<ThreadList>,
    ids: ThreadIdAllocator,
    pub(crate) safepoint: Arc<Safepoint>,
    pub(crate) sync: ObjectSynchronizer,
    pub(crate) queue: Mutex<OperationQueue>,
    pub(crate) queue_cv: Condvar,
    pub(crate) stats: Arc<VmStats>,
    pub(crate) logger: Arc<VmLogger>,
    pub(crate) fatal: Arc<FatalHandler>,
    pub(crate) coordinator_thread: Mutex<Option<std::thread::ThreadId>>,
    pub(crate) current_operation: Mutex<Option<CurrentOperation>>,
}

impl RuntimeShared {
    fn new(config: VmConfig) -> Self {
        let threads = Arc::new(ThreadList::new());
        let safepoint = Arc::new(Safepoint::new());
        let stats = Arc::new(VmStats::new(config.stats_enabled));
        let logger = Arc::new(VmLogger::for_runtime(config.verbose));
        let fatal = Arc::new(FatalHandler::new(
            config.fatal_policy,
            Arc::clone(&threads),
            Arc::clone(&logger),
        ));

        let sync = ObjectSynchronizer::new(
            MonitorRegistry::new(&config),
            Arc::clone(&safepoint),
            Arc::clone(&threads),
            Arc::clone(&stats),
            Arc::clone(&logger),
            Arc::clone(&fatal),
            config.monitor_usage_deflation_threshold_pct,
            config.verify_monitors,
        );

        Self {
            queue: Mutex::new(OperationQueue::new(config.queue_fairness_ratio)),
            queue_cv: Condvar::new(),
            state: AtomicU8::new(RuntimeState::Initialized as u8),
            ids: ThreadIdAllocator::default(),
            coordinator_thread: Mutex::new(None),
            current_operation: Mutex::new(None),
            config,
            threads,
            safepoint,
            sync,
            stats,
            logger,
            fatal,
        }
    }

    pub(crate) fn state(&self) -> RuntimeState {
        RuntimeState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: RuntimeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn is_coordinator_thread(&self) -> bool {
        *self.coordinator_thread.lock() == Some(std::thread::current().id())
    }

    /// Enqueue `op` and block until the coordinator has executed it
    ///
    /// A mutator requester waits in the `Blocked` state so it never holds up
    /// the safepoint its own operation needs.
    fn submit(&self, op: Arc<dyn VmOperation>, requester: Option<&MutatorThread>) -> Result<()> {
        self.fatal.check()?;

        if self.is_coordinator_thread() {
            return coordinator::run_nested(self, op);
        }

        if let Some(thread) = requester {
            if thread.is_terminated() {
                return Err(FvmError::ThreadTerminated(thread.id()));
            }
        }

        let tickets = requester.map_or_else(
            || Arc::new(TicketBox::new()),
            |thread| Arc::clone(thread.tickets()),
        );

        let ticket = {
            let mut queue = self.queue.lock();
            match self.state() {
                RuntimeState::Running => {}
                RuntimeState::Initialized => {
                    return Err(FvmError::InvalidState {
                        expected: RuntimeState::Running.to_string(),
                        actual: RuntimeState::Initialized.to_string(),
                    });
                }
                RuntimeState::Stopping | RuntimeState::Stopped => return Err(FvmError::Shutdown),
            }
            let queued = QueuedOperation::new(op, requester.map(|t| t.id()), Arc::clone(&tickets));
            let ticket = queued.ticket;
            queue.push(queued);
            ticket
        };
        self.queue_cv.notify_one();

        match requester {
            Some(thread) => self
                .safepoint
                .blocked(thread, || tickets.wait_for(ticket)),
            None => tickets.wait_for(ticket),
        }
    }

    fn execute_handshake(&self, op: HandshakeOperation, requester: Option<&MutatorThread>) -> Result<HandshakeOutcome> {
        let op = Arc::new(op);
        self.submit(Arc::clone(&op) as Arc<dyn VmOperation>, requester)?;
        Ok(op.outcome())
    }
}

// ============================================================================
// RUNTIME
// ============================================================================

/// Runtime - one engine instance with its own coordinator thread
pub struct Runtime {
    shared: Arc<RuntimeShared>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Create a runtime without starting the coordinator
    pub fn new(config: VmConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(RuntimeShared::new(config)),
            coordinator: Mutex::new(None),
        })
    }

    /// Create and start a runtime
    pub fn with_config(config: VmConfig) -> Result<Self> {
        let runtime = Self::new(config)?;
        runtime.start()?;
        Ok(runtime)
    }

    /// Spawn the coordinator thread
    pub fn start(&self) -> Result<()> {
        let mut coordinator = self.coordinator.lock();
        let state = self.shared.state();
        if state != RuntimeState::Initialized {
            return Err(FvmError::InvalidState {
                expected: RuntimeState::Initialized.to_string(),
                actual: state.to_string(),
            });
        }

        self.shared.set_state(RuntimeState::Running);
        let handle = coordinator::spawn(Arc::clone(&self.shared)).map_err(|err| {
            self.shared.set_state(RuntimeState::Stopped);
            FvmError::ResourceExhausted {
                resource: format!("coordinator thread: {}", err),
            }
        })?;
        *coordinator = Some(handle);

        log::info!("[VM] Runtime started");
        Ok(())
    }

    /// Stop accepting operations, run what is queued and join the coordinator
    pub fn stop(&self) -> Result<()> {
        let handle = {
            let mut coordinator = self.coordinator.lock();
            {
                let _queue = self.shared.queue.lock();
                match self.shared.state() {
                    RuntimeState::Running => self.shared.set_state(RuntimeState::Stopping),
                    RuntimeState::Initialized => {
                        self.shared.set_state(RuntimeState::Stopped);
                        return Ok(());
                    }
                    RuntimeState::Stopping | RuntimeState::Stopped => return Ok(()),
                }
            }
            self.shared.queue_cv.notify_all();
            coordinator.take()
        };

        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("[VM] Coordinator thread panicked");
            }
        }

        // Anything submitted while the coordinator was exiting
        for op in self.shared.queue.lock().drain_all() {
            op.complete(Err(FvmError::Shutdown));
        }

        self.shared.set_state(RuntimeState::Stopped);
        log::info!("[VM] Runtime stopped");
        Ok(())
    }

    pub fn state(&self) -> RuntimeState {
        self.shared.state()
    }

    /// Register the calling thread as a mutator
    ///
    /// The returned handle starts in managed code. If a safepoint is in
    /// progress the call waits for it to end.
    pub fn attach_thread(&self, name: impl Into<String>) -> Result<MutatorHandle> {
        self.shared.fatal.check()?;
        match self.shared.state() {
            RuntimeState::Initialized | RuntimeState::Running => {}
            RuntimeState::Stopping | RuntimeState::Stopped => return Err(FvmError::Shutdown),
        }

        let thread = Arc::new(MutatorThread::new(
            self.shared.ids.next(),
            name,
            self.shared.config.monitor_initial_provision,
        ));
        self.shared.threads.add(Arc::clone(&thread));
        self.shared.safepoint.transition_to_managed(&thread);

        log::debug!("[VM] Attached thread {} '{}'", thread.id(), thread.name());
        Ok(MutatorHandle {
            shared: Arc::clone(&self.shared),
            thread,
            detached: false,
        })
    }

    /// Submit and block until executed
    ///
    /// Meant for threads that are not attached. If the calling thread has an
    /// attached `MutatorHandle`, the call waits as that thread (in the
    /// `Blocked` state), exactly like `MutatorHandle::submit`; waiting while
    /// counted as running managed code would stall the safepoint forever.
    pub fn submit(&self, op: Arc<dyn VmOperation>) -> Result<()> {
        let caller = self.shared.threads.find_current();
        self.shared.submit(op, caller.as_deref())
    }

    /// Run `closure` against `target` without a global stop
    ///
    /// Returns `false` without blocking if the target has terminated.
    pub fn execute_handshake<F>(&self, target: &Arc<MutatorThread>, name: &str, closure: F) -> Result<bool>
    where
        F: Fn(&MutatorThread) + Send + Sync + 'static,
    {
        let caller = self.shared.threads.find_current();
        handshake_one(&self.shared, caller.as_deref(), target, name, closure)
    }

    /// Run `closure` against every attached thread; returns how many executed
    pub fn execute_handshake_all<F>(&self, name: &str, closure: F) -> Result<usize>
    where
        F: Fn(&MutatorThread) + Send + Sync + 'static,
    {
        let op = HandshakeOperation::new(Handshake::new(name, closure), HandshakeTargets::All);
        let caller = self.shared.threads.find_current();
        Ok(self.shared.execute_handshake(op, caller.as_deref())?.executed)
    }

    /// Force a maintenance safepoint (deflation) now
    pub fn request_cleanup(&self) -> Result<()> {
        self.submit(Arc::new(MaintenanceOperation))
    }

    /// Audit every monitor list inside a safepoint
    pub fn audit_monitors(&self) -> Result<AuditReport> {
        let report = Arc::new(Mutex::new(None));
        let op = {
            let report = Arc::clone(&report);
            FnOperation::safepoint("audit-monitors", move |ctx| {
                let threads = ctx.threads();
                *report.lock() = Some(ctx.synchronizer().audit(&threads));
                Ok(())
            })
        };
        self.submit(op.into_arc())?;

        let report = report.lock().take();
        report.ok_or_else(|| FvmError::InvariantViolation("audit produced no report".to_string()))
    }

    pub fn synchronizer(&self) -> &ObjectSynchronizer {
        &self.shared.sync
    }

    /// Thread owning `object`'s lock (diagnostics; may be stale)
    pub fn current_owner(&self, object: &ManagedObject) -> Option<ThreadId> {
        self.shared.sync.current_owner(object)
    }

    pub fn threads(&self) -> Vec<Arc<MutatorThread>> {
        self.shared.threads.snapshot()
    }

    pub fn pending_operations(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn safepoint(&self) -> &Safepoint {
        &self.shared.safepoint
    }

    pub fn stats(&self) -> &VmStats {
        &self.shared.stats
    }

    pub fn logger(&self) -> &VmLogger {
        &self.shared.logger
    }

    pub fn config(&self) -> &VmConfig {
        &self.shared.config
    }

    /// Whether a fatal error has been intercepted
    pub fn is_failed(&self) -> bool {
        self.shared.fatal.is_failed()
    }

    pub fn thread_dump(&self) -> String {
        self.shared.fatal.thread_dump()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("[VM] Error stopping runtime: {}", err);
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state())
            .field("threads", &self.shared.threads.len())
            .field("safepoint_id", &self.shared.safepoint.safepoint_id())
            .finish()
    }
}

fn handshake_one<F>(
    shared: &RuntimeShared,
    requester: Option<&MutatorThread>,
    target: &Arc<MutatorThread>,
    name: &str,
    closure: F,
) -> Result<bool>
where
    F: Fn(&MutatorThread) + Send + Sync + 'static,
{
    if target.is_terminated() {
        return Ok(false);
    }
    let op = HandshakeOperation::new(
        Handshake::new(name, closure),
        HandshakeTargets::Single(Arc::clone(target)),
    );
    Ok(shared.execute_handshake(op, requester)?.executed == 1)
}

// ============================================================================
// MUTATOR HANDLE
// ============================================================================

/// MutatorHandle - an attached application thread
///
/// Use a handle only from the thread that attached it: its state
/// transitions describe that thread.
pub struct MutatorHandle {
    shared: Arc<RuntimeShared>,
    thread: Arc<MutatorThread>,
    detached: bool,
}

impl MutatorHandle {
    pub fn id(&self) -> ThreadId {
        self.thread.id()
    }

    pub fn name(&self) -> &str {
        self.thread.name()
    }

    pub fn thread(&self) -> &Arc<MutatorThread> {
        &self.thread
    }

    pub fn state(&self) -> ThreadState {
        self.thread.state()
    }

    /// Safepoint checkpoint
    ///
    /// Parks while a safepoint is in progress, then runs a handshake armed
    /// for this thread.
    ///
    /// A thread in native code or blocked is already safe; polling there does
    /// nothing.
    pub fn poll(&self) {
        if self.thread.state() != ThreadState::InManaged {
            return;
        }
        self.shared.safepoint.poll(&self.thread);
        self.thread
            .handshake()
            .process_by_self(&self.thread, &self.shared.stats, &self.shared.logger);
    }

    /// Leave managed code for native code with a walkable stack
    pub fn enter_native(&mut self) -> NativeScope<'_> {
        self.native_scope(ThreadState::InNativeWalkable)
    }

    /// Leave managed code for native code with no managed frames
    pub fn enter_native_no_stack(&mut self) -> NativeScope<'_> {
        self.native_scope(ThreadState::InNativeNoStack)
    }

    fn native_scope(&mut self, state: ThreadState) -> NativeScope<'_> {
        self.shared.safepoint.enter_safe_state(&self.thread, state);
        NativeScope { handle: self }
    }

    /// Run `f` with this thread counted as safe
    pub fn blocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.shared.safepoint.blocked(&self.thread, f)
    }

    // ------------------------------------------------------------------------
    // Object locking
    // ------------------------------------------------------------------------

    /// Run `f` in managed code
    ///
    /// Lock words and monitor lists only change in managed code, where the
    /// thread is visible to the safepoint protocol. A thread calling in from
    /// native code (through `NativeScope::handle`) or from a safe state
    /// waits out any safepoint first and returns to its previous state after.
    fn in_managed<R>(&self, f: impl FnOnce(&ObjectSynchronizer, &MutatorThread) -> R) -> R {
        let previous = self.thread.state();
        if previous == ThreadState::InManaged {
            return f(&self.shared.sync, &self.thread);
        }

        self.shared.safepoint.transition_to_managed(&self.thread);
        let result = f(&self.shared.sync, &self.thread);
        self.shared.safepoint.enter_safe_state(&self.thread, previous);
        result
    }

    pub fn enter(&self, object: &ObjectRef, record: Pin<&LockRecord>) -> Result<()> {
        self.in_managed(|sync, thread| sync.enter(thread, object, record))
    }

    pub fn exit(&self, object: &ObjectRef, record: Pin<&LockRecord>) -> Result<()> {
        self.in_managed(|sync, thread| sync.exit(thread, object, record))
    }

    /// Wait on a held lock; `timeout_ms == 0` waits indefinitely
    pub fn wait(&self, object: &ObjectRef, timeout_ms: u64) -> Result<WaitStatus> {
        self.in_managed(|sync, thread| sync.wait(thread, object, timeout_ms))
    }

    pub fn notify(&self, object: &ObjectRef) -> Result<()> {
        self.in_managed(|sync, thread| sync.notify(thread, object))
    }

    pub fn notify_all(&self, object: &ObjectRef) -> Result<()> {
        self.in_managed(|sync, thread| sync.notify_all(thread, object))
    }

    pub fn identity_hash(&self, object: &ObjectRef) -> Result<u32> {
        self.in_managed(|sync, thread| sync.identity_hash(thread, object))
    }

    pub fn current_owner(&self, object: &ManagedObject) -> Option<ThreadId> {
        self.shared.sync.current_owner(object)
    }

    /// Force `object`'s lock into a monitor, returning the monitor address
    pub fn inflate(&self, object: &ObjectRef) -> Result<usize> {
        self.in_managed(|sync, thread| {
            sync.inflate(thread, object, InflateCause::VmInternal)
                .map(|monitor| monitor.address())
        })
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Submit and block (in the `Blocked` state) until executed
    pub fn submit(&self, op: Arc<dyn VmOperation>) -> Result<()> {
        self.shared.submit(op, Some(&self.thread))
    }

    pub fn execute_handshake<F>(&self, target: &Arc<MutatorThread>, name: &str, closure: F) -> Result<bool>
    where
        F: Fn(&MutatorThread) + Send + Sync + 'static,
    {
        handshake_one(&self.shared, Some(&self.thread), target, name, closure)
    }

    pub fn execute_handshake_all<F>(&self, name: &str, closure: F) -> Result<usize>
    where
        F: Fn(&MutatorThread) + Send + Sync + 'static,
    {
        let op = HandshakeOperation::new(Handshake::new(name, closure), HandshakeTargets::All);
        Ok(self
            .shared
            .execute_handshake(op, Some(&self.thread))?
            .executed)
    }

    /// Detach from the runtime
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;

        self.poll();

        let held = self.thread.stack_lock_count();
        if held > 0 {
            log::warn!(
                "[VM] Thread {} detaching with {} stack locks held",
                self.thread.id(),
                held
            );
        }

        self.shared.sync.registry().flush(self.thread.monitors());
        self.thread.set_state(ThreadState::Terminated);
        self.shared.threads.remove(self.thread.id());
        log::debug!("[VM] Detached thread {}", self.thread.id());
    }
}

impl Drop for MutatorHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for MutatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatorHandle")
            .field("thread", &self.thread)
            .finish()
    }
}

/// Native-code scope; dropping it returns the thread to managed code
pub struct NativeScope<'a> {
    handle: &'a mut MutatorHandle,
}

impl NativeScope<'_> {
    pub fn handle(&self) -> &MutatorHandle {
        self.handle
    }
}

impl Drop for NativeScope<'_> {
    fn drop(&mut self) {
        self.handle
            .shared
            .safepoint
            .transition_to_managed(&self.handle.thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> Runtime {
        Runtime::with_config(VmConfig {
            guaranteed_safepoint_interval_ms: 0,
            fatal_policy: crate::config::FatalPolicy::Intercept,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_attach_and_detach() {
        let runtime = runtime();
        let mutator = runtime.attach_thread("worker").unwrap();
        let thread = Arc::clone(mutator.thread());

        assert_eq!(mutator.state(), ThreadState::InManaged);
        assert_eq!(runtime.threads().len(), 1);

        mutator.detach();
        assert!(thread.is_terminated());
        assert!(runtime.threads().is_empty());
    }

    #[test]
    fn test_native_scope_restores_managed() {
        let runtime = runtime();
        let mut mutator = runtime.attach_thread("worker").unwrap();

        {
            let _native = mutator.enter_native();
        }
        assert_eq!(mutator.state(), ThreadState::InManaged);

        let state = mutator.blocked(|| 7);
        assert_eq!(state, 7);
        assert_eq!(mutator.state(), ThreadState::InManaged);
    }

    #[test]
    fn test_detached_thread_cannot_submit() {
        let runtime = runtime();
        let mutator = runtime.attach_thread("worker").unwrap();
        let thread = Arc::clone(mutator.thread());
        mutator.detach();

        let err = runtime
            .shared
            .submit(Arc::new(MaintenanceOperation), Some(&thread))
            .unwrap_err();
        assert!(matches!(err, FvmError::ThreadTerminated(_)));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let runtime = runtime();
        runtime.stop().unwrap();
        runtime.stop().unwrap();
        assert_eq!(runtime.state(), RuntimeState::Stopped);
    }
}
