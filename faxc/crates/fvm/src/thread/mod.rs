//! Thread Module - Mutator Thread Records
//!
//! A `MutatorThread` is the engine's view of one application thread:
//! - its execution state (the input to every "is it safe" decision)
//! - its handshake slot
//! - its private monitor free/in-use lists
//! - the stack-lock records it currently owns
//! - the ticket box it waits on after submitting an operation
//!
//! The thread-side halves of the safepoint and handshake protocols live in
//! `runtime`; this module is plain per-thread data.

pub mod list;
pub mod lock_stack;
pub mod state;

pub use list::ThreadList;
pub use lock_stack::LockStack;
pub use state::{AtomicThreadState, ThreadState};

use crate::monitor::ThreadMonitorCache;
use crate::runtime::handshake::HandshakeSlot;
use crate::runtime::operation::TicketBox;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a mutator thread
///
/// Raw value 0 is reserved for "no thread" in lock owner fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct ThreadId(u64);

impl ThreadId {
    pub const NONE_RAW: u64 = 0;

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Decode an owner field, where 0 means unowned
    #[inline]
    pub fn from_owner_field(raw: u64) -> Option<Self> {
        (raw != Self::NONE_RAW).then_some(Self(raw))
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Allocates thread ids, starting at 1
#[derive(Default)]
pub struct ThreadIdAllocator {
    next: AtomicU64,
}

impl ThreadIdAllocator {
    pub fn next(&self) -> ThreadId {
        ThreadId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Per-thread engine state
pub struct MutatorThread {
    id: ThreadId,
    name: String,
    state: AtomicThreadState,
    handshake: HandshakeSlot,
    monitors: ThreadMonitorCache,
    tickets: Arc<TicketBox>,
    /// OS thread that attached this record
    os_thread: std::thread::ThreadId,
    /// Stack-lock records this thread installed and still owns
    lock_stack: LockStack,
}

impl MutatorThread {
    /// New threads start `Blocked`; attaching moves them into managed code
    /// through the safepoint poll. The record belongs to the calling OS thread.
    pub fn new(id: ThreadId, name: impl Into<String>, initial_provision: usize) -> Self {
        Self {
            id,
            name: name.into(),
            state: AtomicThreadState::new(ThreadState::Blocked),
            handshake: HandshakeSlot::new(),
            monitors: ThreadMonitorCache::new(initial_provision),
            tickets: Arc::new(TicketBox::new()),
            os_thread: std::thread::current().id(),
            lock_stack: LockStack::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS thread this record describes
    pub fn os_thread(&self) -> std::thread::ThreadId {
        self.os_thread
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        self.state.load()
    }

    #[inline]
    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state);
    }

    #[inline]
    pub(crate) fn swap_state(&self, state: ThreadState) -> ThreadState {
        self.state.swap(state)
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.state() == ThreadState::Terminated
    }

    /// Best-effort check; may be stale by the time the caller acts on it
    #[inline]
    pub fn is_safe_for_global_operation(&self) -> bool {
        self.state().is_safe_for_global_operation()
    }

    pub fn handshake(&self) -> &HandshakeSlot {
        &self.handshake
    }

    pub fn has_pending_handshake(&self) -> bool {
        self.handshake.is_armed()
    }

    pub fn monitors(&self) -> &ThreadMonitorCache {
        &self.monitors
    }

    /// Completion tickets for operations this thread submitted
    pub fn tickets(&self) -> &Arc<TicketBox> {
        &self.tickets
    }

    pub fn lock_stack(&self) -> &LockStack {
        &self.lock_stack
    }

    /// Owner thread only; false when the lock stack is full
    pub(crate) fn push_lock_record(&self, addr: usize) -> bool {
        self.lock_stack.push(addr)
    }

    pub(crate) fn remove_lock_record(&self, addr: usize) {
        self.lock_stack.remove(addr);
    }

    /// Whether `addr` is a stack-lock record owned by this thread
    #[inline]
    pub(crate) fn owns_lock_record(&self, addr: usize) -> bool {
        self.lock_stack.contains(addr)
    }

    /// Number of stack locks currently held
    pub fn stack_lock_count(&self) -> usize {
        self.lock_stack.len()
    }
}

impl std::fmt::Debug for MutatorThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatorThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("pending_handshake", &self.has_pending_handshake())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_ids_start_at_one() {
        let ids = ThreadIdAllocator::default();
        assert_eq!(ids.next().as_u64(), 1);
        assert_eq!(ids.next().as_u64(), 2);
        assert_eq!(ThreadId::from_owner_field(0), None);
    }

    #[test]
    fn test_lock_record_tracking() {
        let thread = MutatorThread::new(ThreadId::from_raw(1), "t", 4);
        assert!(thread.push_lock_record(0x1000));
        assert!(thread.owns_lock_record(0x1000));
        assert!(!thread.owns_lock_record(0x2000));
        thread.remove_lock_record(0x1000);
        assert_eq!(thread.stack_lock_count(), 0);
    }
}
