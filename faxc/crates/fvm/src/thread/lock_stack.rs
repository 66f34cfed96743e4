//! Lock Stack - stack-lock records owned by one thread
//!
//! Fixed capacity, written only by the owning thread, so push and remove
//! never allocate or take a lock. Other threads read it for diagnostics
//! (`current_owner`, thread dumps) and may see a slightly stale view.
//!
//! When the stack is full, further locks skip the stack-lock fast path and
//! go straight to a monitor.

use crate::util::constants::LOCK_STACK_CAPACITY;
use std::sync::atomic::{AtomicUsize, Ordering};

/// LockStack - addresses of the `LockRecord`s behind this thread's stack locks
pub struct LockStack {
    records: [AtomicUsize; LOCK_STACK_CAPACITY],
    top: AtomicUsize,
}

impl LockStack {
    pub const fn new() -> Self {
        Self {
            records: [const { AtomicUsize::new(0) }; LOCK_STACK_CAPACITY],
            top: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.top.load(Ordering::Acquire).min(LOCK_STACK_CAPACITY)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == LOCK_STACK_CAPACITY
    }

    /// Record a stack lock; owner thread only. Returns false when full.
    pub(crate) fn push(&self, addr: usize) -> bool {
        let top = self.top.load(Ordering::Relaxed);
        if top >= LOCK_STACK_CAPACITY {
            return false;
        }
        self.records[top].store(addr, Ordering::Release);
        self.top.store(top + 1, Ordering::Release);
        true
    }

    /// Forget a stack lock; owner thread only
    ///
    /// Locks are usually released innermost first, so the search starts
    /// from the top.
    pub(crate) fn remove(&self, addr: usize) {
        let top = self.top.load(Ordering::Relaxed);
        let Some(pos) = (0..top)
            .rev()
            .find(|&i| self.records[i].load(Ordering::Relaxed) == addr)
        else {
            return;
        };

        for i in pos..top - 1 {
            let next = self.records[i + 1].load(Ordering::Relaxed);
            self.records[i].store(next, Ordering::Release);
        }
        self.records[top - 1].store(0, Ordering::Release);
        self.top.store(top - 1, Ordering::Release);
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let top = self.len();
        self.records[..top]
            .iter()
            .rev()
            .any(|record| record.load(Ordering::Acquire) == addr)
    }
}

impl Default for LockStack {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockStack")
            .field("len", &self.len())
            .field("capacity", &LOCK_STACK_CAPACITY)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_remove_out_of_order() {
        let stack = LockStack::new();
        assert!(stack.push(0x1000));
        assert!(stack.push(0x2000));
        assert!(stack.push(0x3000));

        stack.remove(0x2000);
        assert_eq!(stack.len(), 2);
        assert!(stack.contains(0x1000));
        assert!(!stack.contains(0x2000));
        assert!(stack.contains(0x3000));

        stack.remove(0x4000);
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn test_full_stack_refuses_push() {
        let stack = LockStack::new();
        for i in 0..LOCK_STACK_CAPACITY {
            assert!(stack.push((i + 1) * 8));
        }
        assert!(stack.is_full());
        assert!(!stack.push(0xdead_0000));
        assert!(!stack.contains(0xdead_0000));

        stack.remove(8);
        assert!(!stack.is_full());
        assert!(stack.push(0xdead_0000));
    }
}
