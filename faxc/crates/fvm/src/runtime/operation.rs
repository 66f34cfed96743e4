//! VM Operations
//!
//! A `VmOperation` is work the coordinator thread runs on a requester's
//! behalf, either inside a safepoint or as an ordinary operation. Requesters
//! block on a ticket from their own `TicketBox` until the coordinator has
//! executed the operation.
//!
//! # Examples
//!
//! ```rust,no_run
//! use fvm::runtime::{FnOperation, Runtime};
//! use fvm::VmConfig;
//!
//! let runtime = Runtime::with_config(VmConfig::default()).unwrap();
//! let op = FnOperation::safepoint("count-threads", |ctx| {
//!     assert!(ctx.is_at_safepoint());
//!     println!("{} threads stopped", ctx.threads().len());
//!     Ok(())
//! });
//! runtime.submit(op.into_arc()).unwrap();
//! ```

use super::{coordinator, RuntimeShared};
use crate::config::VmConfig;
use crate::error::{FvmError, Result};
use crate::stats::VmStats;
use crate::sync::ObjectSynchronizer;
use crate::thread::MutatorThread;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Operation priority class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Runs while every mutator is stopped
    Safepoint,
    /// Runs on the coordinator thread without stopping anyone
    Ordinary,
}

impl OperationKind {
    pub fn of(op: &dyn VmOperation) -> Self {
        if op.evaluate_at_safepoint() {
            OperationKind::Safepoint
        } else {
            OperationKind::Ordinary
        }
    }
}

/// Work executed by the coordinator thread
pub trait VmOperation: Send + Sync {
    /// Name for logs and events
    fn name(&self) -> &str;

    /// The operation body
    fn evaluate(&self, ctx: &OperationContext<'_>) -> Result<()>;

    /// Whether all mutators must be stopped first
    fn evaluate_at_safepoint(&self) -> bool {
        true
    }

    /// Whether this operation may submit further operations from its body
    fn allow_nested(&self) -> bool {
        false
    }
}

/// What an executing operation can see
pub struct OperationContext<'a> {
    shared: &'a RuntimeShared,
    operation: &'a dyn VmOperation,
    at_safepoint: bool,
}

impl<'a> OperationContext<'a> {
    pub(crate) fn new(
        shared: &'a RuntimeShared,
        operation: &'a dyn VmOperation,
        at_safepoint: bool,
    ) -> Self {
        Self {
            shared,
            operation,
            at_safepoint,
        }
    }

    pub fn operation_name(&self) -> &str {
        self.operation.name()
    }

    /// Whether every mutator is currently stopped
    pub fn is_at_safepoint(&self) -> bool {
        self.at_safepoint
    }

    pub fn safepoint_id(&self) -> u64 {
        self.shared.safepoint.safepoint_id()
    }

    /// Snapshot of the attached threads
    pub fn threads(&self) -> Vec<Arc<MutatorThread>> {
        self.shared.threads.snapshot()
    }

    pub fn synchronizer(&self) -> &ObjectSynchronizer {
        &self.shared.sync
    }

    pub fn stats(&self) -> &VmStats {
        &self.shared.stats
    }

    pub fn config(&self) -> &VmConfig {
        &self.shared.config
    }

    /// Run `op` inline; legal only if the current operation allows nesting
    pub fn execute_nested(&self, op: Arc<dyn VmOperation>) -> Result<()> {
        coordinator::run_nested(self.shared, op)
    }

    pub(crate) fn shared(&self) -> &RuntimeShared {
        self.shared
    }
}

/// Closure-backed operation
pub struct FnOperation<F> {
    name: String,
    at_safepoint: bool,
    allow_nested: bool,
    body: F,
}

impl<F> FnOperation<F>
where
    F: Fn(&OperationContext<'_>) -> Result<()> + Send + Sync,
{
    /// Operation that runs inside a safepoint
    pub fn safepoint(name: impl Into<String>, body: F) -> Self {
        Self {
            name: name.into(),
            at_safepoint: true,
            allow_nested: false,
            body,
        }
    }

    /// Operation that runs without stopping mutators
    pub fn ordinary(name: impl Into<String>, body: F) -> Self {
        Self {
            name: name.into(),
            at_safepoint: false,
            allow_nested: false,
            body,
        }
    }

    pub fn allowing_nested(mut self) -> Self {
        self.allow_nested = true;
        self
    }
}

impl<F> FnOperation<F>
where
    F: Fn(&OperationContext<'_>) -> Result<()> + Send + Sync + 'static,
{
    pub fn into_arc(self) -> Arc<dyn VmOperation> {
        Arc::new(self)
    }
}

impl<F> VmOperation for FnOperation<F>
where
    F: Fn(&OperationContext<'_>) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, ctx: &OperationContext<'_>) -> Result<()> {
        (self.body)(ctx)
    }

    fn evaluate_at_safepoint(&self) -> bool {
        self.at_safepoint
    }

    fn allow_nested(&self) -> bool {
        self.allow_nested
    }
}

/// Safepoint with an empty body; only the cleanup tasks run
pub struct MaintenanceOperation;

impl VmOperation for MaintenanceOperation {
    fn name(&self) -> &str {
        "maintenance"
    }

    fn evaluate(&self, _ctx: &OperationContext<'_>) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// TICKETS
// ============================================================================

struct TicketState {
    completed: u64,
    failure: Option<(u64, FvmError)>,
}

/// Completion tickets of one requester
///
/// Tickets are issued in submission order. The coordinator marks a ticket
/// completed after executing its operation; the requester wakes once the
/// completed counter reaches its ticket.
pub struct TicketBox {
    issued: AtomicU64,
    state: Mutex<TicketState>,
    completion: Condvar,
}

impl TicketBox {
    pub fn new() -> Self {
        Self {
            issued: AtomicU64::new(0),
            state: Mutex::new(TicketState {
                completed: 0,
                failure: None,
            }),
            completion: Condvar::new(),
        }
    }

    /// Tickets handed out so far
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Acquire)
    }

    /// Highest ticket completed so far
    pub fn completed(&self) -> u64 {
        self.state.lock().completed
    }

    pub(crate) fn issue(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn complete(&self, ticket: u64, result: Result<()>) {
        let mut state = self.state.lock();
        if let Err(err) = result {
            state.failure = Some((ticket, err));
        }
        state.completed = state.completed.max(ticket);
        drop(state);
        self.completion.notify_all();
    }

    /// Block until `ticket` completes, returning the operation's result
    pub(crate) fn wait_for(&self, ticket: u64) -> Result<()> {
        let mut state = self.state.lock();
        while state.completed < ticket {
            self.completion.wait(&mut state);
        }
        match state.failure.take() {
            Some((failed, err)) if failed == ticket => Err(err),
            other => {
                state.failure = other;
                Ok(())
            }
        }
    }
}

impl Default for TicketBox {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TicketBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketBox")
            .field("issued", &self.issued())
            .field("completed", &self.completed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_ticket_wait_returns_at_completion() {
        let tickets = Arc::new(TicketBox::new());
        let ticket = tickets.issue();
        assert_eq!(ticket, 1);

        let waiter = {
            let tickets = Arc::clone(&tickets);
            thread::spawn(move || tickets.wait_for(ticket))
        };

        tickets.complete(ticket, Ok(()));
        waiter.join().unwrap().unwrap();
        assert_eq!(tickets.completed(), tickets.issued());
    }

    #[test]
    fn test_ticket_failure_goes_to_its_ticket() {
        let tickets = TicketBox::new();
        let first = tickets.issue();
        let second = tickets.issue();

        tickets.complete(second, Err(FvmError::illegal_lock("op", "bad")));
        tickets.complete(first, Ok(()));

        assert!(tickets.wait_for(first).is_ok());
        assert!(matches!(
            tickets.wait_for(second),
            Err(FvmError::IllegalLockState { .. })
        ));
    }

    #[test]
    fn test_kind_follows_operation() {
        let sp = FnOperation::safepoint("sp", |_| Ok(()));
        let ord = FnOperation::ordinary("ord", |_| Ok(()));
        assert_eq!(OperationKind::of(&sp), OperationKind::Safepoint);
        assert_eq!(OperationKind::of(&ord), OperationKind::Ordinary);
        assert!(!sp.allow_nested());
        assert!(sp.allowing_nested().allow_nested());
    }
}
