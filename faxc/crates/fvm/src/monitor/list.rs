//! Monitor Lists - lock-free singly linked lists of monitors
//!
//! Lists are threaded through `ObjectMonitor::next`. Bit 0 of that field is a
//! spinlock owned by whoever set it:
//!
//! ```text
//! next: ┌─────────────────────────────────────┬──────┐
//!       │ address of next monitor (or null)   │ lock │
//!       └─────────────────────────────────────┴──────┘
//! ```
//!
//! Rules:
//! - A node's `next` is written only by the holder of that node's lock bit.
//! - A list head is replaced only by a thread holding the lock of the node it
//!   currently points at, or by a CAS from null.
//! - To lock a list head: lock the node, re-read the head, retry if it moved.
//!
//! Nodes are never freed while the registry lives, so a stale pointer can
//! still be locked safely; the head re-check turns such a lock into a retry.

use super::ObjectMonitor;
use crate::util::SpinWait;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

const LOCK_BIT: usize = 1;

impl ObjectMonitor {
    #[inline]
    pub(crate) fn try_lock_link(&self) -> bool {
        let current = self.next.load(Ordering::Relaxed);
        current & LOCK_BIT == 0
            && self
                .next
                .compare_exchange(
                    current,
                    current | LOCK_BIT,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
    }

    pub(crate) fn lock_link(&self) {
        let mut spin = SpinWait::new();
        while !self.try_lock_link() {
            spin.snooze();
        }
    }

    #[inline]
    pub(crate) fn unlock_link(&self) {
        let prev = self.next.fetch_and(!LOCK_BIT, Ordering::Release);
        debug_assert!(prev & LOCK_BIT != 0, "unlocking an unlocked monitor link");
    }

    #[inline]
    pub(crate) fn is_link_locked(&self) -> bool {
        self.next.load(Ordering::Relaxed) & LOCK_BIT != 0
    }

    /// Caller holds this node's lock
    #[inline]
    fn set_next_locked(&self, next: *const ObjectMonitor) {
        self.next.store(next as usize | LOCK_BIT, Ordering::Release);
    }

    #[inline]
    pub(crate) fn next_ptr(&self) -> *const ObjectMonitor {
        (self.next.load(Ordering::Acquire) & !LOCK_BIT) as *const ObjectMonitor
    }

    pub(super) fn link_to(&self, next: *const ObjectMonitor) {
        self.lock_link();
        self.set_next_locked(next);
        self.unlock_link();
    }
}

/// Reborrow a list node
///
/// # Safety
/// `ptr` must point into a block of a live `MonitorRegistry`.
#[inline]
unsafe fn node<'a>(ptr: *const ObjectMonitor) -> &'a ObjectMonitor {
    &*ptr
}

/// MonitorList - shared list head plus approximate count
///
/// The count is raised before nodes are published and lowered after they are
/// removed, so it never underflows and is exact whenever the list is quiescent.
pub struct MonitorList {
    head: AtomicPtr<ObjectMonitor>,
    count: AtomicUsize,
}

impl MonitorList {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            count: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Lock the current head node and return it, `None` for an empty list
    fn lock_head(&self) -> Option<&ObjectMonitor> {
        let mut spin = SpinWait::new();
        loop {
            let current = self.head.load(Ordering::Acquire);
            if current.is_null() {
                return None;
            }
            // SAFETY: list nodes live in registry blocks.
            let head = unsafe { node(current) };
            if head.try_lock_link() {
                if self.head.load(Ordering::Acquire) == current {
                    return Some(head);
                }
                head.unlock_link();
            }
            spin.snooze();
        }
    }

    /// Push one private monitor
    pub(crate) fn prepend(&self, monitor: &ObjectMonitor) {
        let mut chain = MonitorChain::new();
        chain.push(monitor);
        self.prepend_chain(chain);
    }

    /// Push a private chain in one step
    pub(crate) fn prepend_chain(&self, chain: MonitorChain) {
        if chain.is_empty() {
            return;
        }

        self.count.fetch_add(chain.len, Ordering::AcqRel);

        // SAFETY: chain nodes live in registry blocks.
        let last = unsafe { node(chain.last) };
        let mut spin = SpinWait::new();

        loop {
            last.lock_link();
            match self.lock_head() {
                Some(head) => {
                    last.set_next_locked(head);
                    self.head.store(chain.first as *mut _, Ordering::Release);
                    head.unlock_link();
                    last.unlock_link();
                    return;
                }
                None => {
                    last.set_next_locked(ptr::null());
                    let published = self
                        .head
                        .compare_exchange(
                            ptr::null_mut(),
                            chain.first as *mut _,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok();
                    last.unlock_link();
                    if published {
                        return;
                    }
                }
            }
            spin.snooze();
        }
    }

    /// Pop the first monitor
    pub(crate) fn take_from_start(&self) -> Option<NonNull<ObjectMonitor>> {
        let head = self.lock_head()?;
        self.head.store(head.next_ptr() as *mut _, Ordering::Release);
        head.set_next_locked(ptr::null());
        head.unlock_link();
        self.count.fetch_sub(1, Ordering::AcqRel);
        Some(NonNull::from(head))
    }

    /// Detach the whole list as a private chain
    pub(crate) fn take_all(&self) -> MonitorChain {
        let Some(head) = self.lock_head() else {
            return MonitorChain::new();
        };
        self.head.store(ptr::null_mut(), Ordering::Release);
        head.unlock_link();

        let mut chain = MonitorChain {
            first: head,
            last: head,
            len: 0,
        };
        let mut current: *const ObjectMonitor = head;
        while !current.is_null() {
            chain.last = current;
            chain.len += 1;
            // SAFETY: detached nodes are private to us and live in blocks.
            current = unsafe { node(current) }.next_ptr();
        }

        self.count.fetch_sub(chain.len, Ordering::AcqRel);
        chain
    }

    /// Unsynchronized walk; only meaningful while the list is quiescent
    pub(crate) fn iter(&self) -> MonitorIter<'_> {
        MonitorIter {
            current: self.head.load(Ordering::Acquire),
            _list: std::marker::PhantomData,
        }
    }
}

impl Default for MonitorList {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MonitorList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorList")
            .field("count", &self.count())
            .finish()
    }
}

/// Private chain of monitors not reachable from any shared list
pub(crate) struct MonitorChain {
    first: *const ObjectMonitor,
    last: *const ObjectMonitor,
    len: usize,
}

impl MonitorChain {
    pub(crate) const fn new() -> Self {
        Self {
            first: ptr::null(),
            last: ptr::null(),
            len: 0,
        }
    }

    /// Push `monitor` at the front; it must not be on any list
    pub(crate) fn push(&mut self, monitor: &ObjectMonitor) {
        monitor.link_to(self.first);
        if self.last.is_null() {
            self.last = monitor;
        }
        self.first = monitor;
        self.len += 1;
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Consume the chain node by node
    pub(crate) fn into_nodes(self) -> MonitorIter<'static> {
        MonitorIter {
            current: self.first,
            _list: std::marker::PhantomData,
        }
    }
}

/// Iterator over list nodes
///
/// Reads each node's `next` before yielding it, so the caller may relink the
/// yielded node.
pub(crate) struct MonitorIter<'a> {
    current: *const ObjectMonitor,
    _list: std::marker::PhantomData<&'a MonitorList>,
}

impl Iterator for MonitorIter<'_> {
    type Item = NonNull<ObjectMonitor>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = NonNull::new(self.current as *mut ObjectMonitor)?;
        // SAFETY: nodes live in registry blocks.
        self.current = unsafe { node(current.as_ptr()) }.next_ptr();
        Some(current)
    }
}

// Raw pointers into registry blocks; the blocks are shared between threads
// and every mutation goes through the link locks above.
unsafe impl Send for MonitorChain {}
