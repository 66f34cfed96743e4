//! Thread execution states
//!
//! The single source of truth for whether a mutator can be treated as
//! paused without its cooperation.

use std::sync::atomic::{AtomicU8, Ordering};

/// Execution state of a mutator thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[repr(u8)]
pub enum ThreadState {
    /// Executing managed code; must reach a poll before it counts as safe
    InManaged = 1,
    /// Parked on a condition variable (operation ticket, monitor entry, wait)
    Blocked = 2,
    /// In native code with a walkable managed stack behind it
    InNativeWalkable = 3,
    /// In native code with no managed frames at all
    InNativeNoStack = 4,
    /// Detached; never runs managed code again
    Terminated = 5,
}

impl ThreadState {
    /// Whether a global operation may proceed while the thread is in this state
    ///
    /// Running managed code is never implicitly safe.
    #[inline]
    pub fn is_safe_for_global_operation(self) -> bool {
        match self {
            ThreadState::InManaged => false,
            ThreadState::Blocked
            | ThreadState::InNativeWalkable
            | ThreadState::InNativeNoStack
            | ThreadState::Terminated => true,
        }
    }

    #[inline]
    pub fn is_native(self) -> bool {
        matches!(
            self,
            ThreadState::InNativeWalkable | ThreadState::InNativeNoStack
        )
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ThreadState::InManaged,
            2 => ThreadState::Blocked,
            3 => ThreadState::InNativeWalkable,
            4 => ThreadState::InNativeNoStack,
            _ => ThreadState::Terminated,
        }
    }
}

impl std::fmt::Display for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ThreadState::InManaged => "in_managed",
            ThreadState::Blocked => "blocked",
            ThreadState::InNativeWalkable => "in_native",
            ThreadState::InNativeNoStack => "in_native_no_stack",
            ThreadState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Atomic cell holding a `ThreadState`
///
/// All accesses are `SeqCst`: the safepoint protocol pairs a state store on
/// the mutator with a poll-flag load, against a poll-flag store and state
/// load on the coordinator.
pub struct AtomicThreadState(AtomicU8);

impl AtomicThreadState {
    pub fn new(state: ThreadState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[inline]
    pub fn load(&self) -> ThreadState {
        ThreadState::from_u8(self.0.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn store(&self, state: ThreadState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Swap in `state`, returning the previous one
    #[inline]
    pub fn swap(&self, state: ThreadState) -> ThreadState {
        ThreadState::from_u8(self.0.swap(state as u8, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safety_predicate() {
        assert!(!ThreadState::InManaged.is_safe_for_global_operation());
        assert!(ThreadState::Blocked.is_safe_for_global_operation());
        assert!(ThreadState::InNativeWalkable.is_safe_for_global_operation());
        assert!(ThreadState::InNativeNoStack.is_safe_for_global_operation());
        assert!(ThreadState::Terminated.is_safe_for_global_operation());
    }

    #[test]
    fn test_atomic_swap() {
        let state = AtomicThreadState::new(ThreadState::InManaged);
        assert_eq!(state.swap(ThreadState::Blocked), ThreadState::InManaged);
        assert_eq!(state.load(), ThreadState::Blocked);
    }
}
