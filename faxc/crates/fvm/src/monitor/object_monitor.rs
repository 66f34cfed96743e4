//! Object Monitor - the heavyweight lock
//!
//! An `ObjectMonitor` is bound to at most one object at a time. While bound it
//! owns the object's displaced lock word (`header`), tracks the owning thread
//! and recursion depth, and queues threads blocked in `enter` or `wait`.
//!
//! Monitors are immortal: they are carved out of registry blocks and recycled
//! through the free lists, never returned to the system allocator while the
//! registry lives. A `&ObjectMonitor` obtained from a lock word therefore
//! stays valid for the registry's lifetime.
//!
//! # Busy
//!
//! A monitor is busy while it has an owner, a positive recursion count, a
//! waiter, or a contender. Contenders and waiters are counted *before* the
//! thread leaves managed state, so a safepoint can never deflate a monitor
//! some blocked thread still expects to acquire.

use crate::error::Result;
use crate::object::{LockWord, ManagedObject, ObjectRef};
use crate::thread::ThreadId;
use crate::util::constants::{CACHE_LINE_ALIGNMENT, SPIN_LIMIT};
use crate::util::SpinWait;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of `wait`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Woken by `notify` / `notify_all`
    Notified,
    /// The timeout elapsed first
    TimedOut,
}

/// Waiters in arrival order plus the tickets already chosen by a notify
#[derive(Default)]
struct WaitSet {
    waiting: VecDeque<u64>,
    notified: Vec<u64>,
    next_ticket: u64,
}

impl WaitSet {
    fn enqueue(&mut self) -> u64 {
        self.next_ticket += 1;
        self.waiting.push_back(self.next_ticket);
        self.next_ticket
    }

    fn notify_one(&mut self) -> bool {
        match self.waiting.pop_front() {
            Some(ticket) => {
                self.notified.push(ticket);
                true
            }
            None => false,
        }
    }

    fn notify_all(&mut self) -> usize {
        let n = self.waiting.len();
        self.notified.extend(self.waiting.drain(..));
        n
    }

    fn take_notified(&mut self, ticket: u64) -> bool {
        match self.notified.iter().position(|&t| t == ticket) {
            Some(pos) => {
                self.notified.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    fn cancel(&mut self, ticket: u64) {
        self.waiting.retain(|&t| t != ticket);
    }
}

// Monitors sit in blocks; each must own its cache line.
const _: () = assert!(std::mem::align_of::<ObjectMonitor>() == CACHE_LINE_ALIGNMENT);

/// ObjectMonitor - queue-capable lock bound to one object
#[repr(C, align(64))]
pub struct ObjectMonitor {
    /// Displaced neutral lock word of the bound object
    header: AtomicUsize,
    /// Bound object, held through one leaked `Arc` strong count
    object: AtomicPtr<ManagedObject>,
    owner: AtomicU64,
    recursions: AtomicUsize,
    waiters: AtomicUsize,
    contentions: AtomicUsize,
    /// Tagged list link, see `monitor::list`
    pub(super) next: AtomicUsize,
    /// Slot 0 of a block: links blocks together, never handed out
    block_link: bool,
    wait_set: Mutex<WaitSet>,
    entry_cv: Condvar,
    wait_cv: Condvar,
}

impl ObjectMonitor {
    pub(crate) fn new() -> Self {
        Self::with_kind(false)
    }

    pub(crate) fn new_block_link() -> Self {
        Self::with_kind(true)
    }

    fn with_kind(block_link: bool) -> Self {
        Self {
            header: AtomicUsize::new(LockWord::NEUTRAL.raw()),
            object: AtomicPtr::new(std::ptr::null_mut()),
            owner: AtomicU64::new(ThreadId::NONE_RAW),
            recursions: AtomicUsize::new(0),
            waiters: AtomicUsize::new(0),
            contentions: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            block_link,
            wait_set: Mutex::new(WaitSet::default()),
            entry_cv: Condvar::new(),
            wait_cv: Condvar::new(),
        }
    }

    #[inline]
    pub fn address(&self) -> usize {
        self as *const ObjectMonitor as usize
    }

    #[inline]
    pub fn is_block_link(&self) -> bool {
        self.block_link
    }

    // ========================================================================
    // HEADER AND BINDING
    // ========================================================================

    #[inline]
    pub fn header(&self) -> LockWord {
        LockWord::from_raw(self.header.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_header(&self, word: LockWord) {
        self.header.store(word.raw(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn cas_header(&self, current: LockWord, new: LockWord) -> std::result::Result<(), LockWord> {
        self.header
            .compare_exchange(current.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(LockWord::from_raw)
    }

    /// Bind to `object`, taking a strong reference to it
    pub(crate) fn bind(&self, object: &ObjectRef) {
        let raw = Arc::into_raw(Arc::clone(object)) as *mut ManagedObject;
        let prev = self.object.swap(raw, Ordering::AcqRel);
        debug_assert!(prev.is_null(), "monitor bound twice");
    }

    /// Drop the binding, returning the strong reference it held
    pub(crate) fn unbind(&self) -> Option<ObjectRef> {
        let raw = self.object.swap(std::ptr::null_mut(), Ordering::AcqRel);
        // SAFETY: non-null values only come from `Arc::into_raw` in `bind`,
        // and the swap hands that count to exactly one caller.
        (!raw.is_null()).then(|| unsafe { Arc::from_raw(raw as *const ManagedObject) })
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        !self.object.load(Ordering::Acquire).is_null()
    }

    /// Address of the bound object, 0 when free
    #[inline]
    pub fn object_address(&self) -> usize {
        self.object.load(Ordering::Acquire) as usize
    }

    /// The bound object
    ///
    /// The returned reference is valid until the monitor is unbound, which
    /// only happens at a safepoint or when the registry is dropped.
    pub(crate) fn bound_object(&self) -> Option<&ManagedObject> {
        let raw = self.object.load(Ordering::Acquire);
        // SAFETY: the binding holds a strong count, see `bind`.
        unsafe { raw.as_ref() }
    }

    // ========================================================================
    // OWNERSHIP
    // ========================================================================

    #[inline]
    pub fn owner(&self) -> Option<ThreadId> {
        ThreadId::from_owner_field(self.owner.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn is_owned_by(&self, thread: ThreadId) -> bool {
        self.owner.load(Ordering::SeqCst) == thread.as_u64()
    }

    #[inline]
    pub(crate) fn set_owner(&self, thread: ThreadId) {
        self.owner.store(thread.as_u64(), Ordering::SeqCst);
    }

    #[inline]
    pub fn recursions(&self) -> usize {
        self.recursions.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn contentions(&self) -> usize {
        self.contentions.load(Ordering::SeqCst)
    }

    /// Owned, recursively held, waited on, or contended
    pub fn is_busy(&self) -> bool {
        self.owner.load(Ordering::SeqCst) != ThreadId::NONE_RAW
            || self.recursions() > 0
            || self.waiters() > 0
            || self.contentions() > 0
    }

    #[inline]
    fn try_acquire(&self, me: ThreadId) -> bool {
        self.owner
            .compare_exchange(
                ThreadId::NONE_RAW,
                me.as_u64(),
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Uncontended enter, including recursive re-entry by the owner
    pub(crate) fn try_enter(&self, me: ThreadId) -> bool {
        if self.is_owned_by(me) {
            self.recursions.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        self.try_acquire(me)
    }

    /// Register as a contender; must precede any thread-state transition
    #[inline]
    pub(crate) fn add_contender(&self) {
        self.contentions.fetch_add(1, Ordering::SeqCst);
    }

    /// Block until ownership is acquired; consumes one `add_contender`
    pub(crate) fn enter_contended(&self, me: ThreadId) {
        let mut spin = SpinWait::new();
        let mut acquired = false;

        for _ in 0..SPIN_LIMIT {
            if self.try_acquire(me) {
                acquired = true;
                break;
            }
            spin.snooze();
        }

        if !acquired {
            let mut set = self.wait_set.lock();
            while !self.try_acquire(me) {
                self.entry_cv.wait(&mut set);
            }
        }

        self.contentions.fetch_sub(1, Ordering::SeqCst);
    }

    /// Release one level of ownership
    pub(crate) fn exit(&self, me: ThreadId) -> Result<()> {
        crate::ensure_owner!(
            self.is_owned_by(me),
            "exit",
            "thread {} does not own monitor {}",
            me,
            crate::util::format_address(self.address())
        );

        if self.recursions() > 0 {
            self.recursions.fetch_sub(1, Ordering::Relaxed);
            return Ok(());
        }

        self.owner.store(ThreadId::NONE_RAW, Ordering::SeqCst);
        if self.contentions() > 0 {
            let _set = self.wait_set.lock();
            self.entry_cv.notify_one();
        }
        Ok(())
    }

    // ========================================================================
    // WAIT / NOTIFY
    // ========================================================================

    /// Release the monitor, wait for a notification or `timeout`, re-acquire
    ///
    /// The recursion depth is restored on return.
    pub(crate) fn wait(&self, me: ThreadId, timeout: Option<Duration>) -> Result<WaitStatus> {
        crate::ensure_owner!(
            self.is_owned_by(me),
            "wait",
            "thread {} does not own monitor {}",
            me,
            crate::util::format_address(self.address())
        );

        let saved_recursions = self.recursions.swap(0, Ordering::Relaxed);
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let deadline = timeout.map(|t| Instant::now() + t);

        let status = {
            let mut set = self.wait_set.lock();
            let ticket = set.enqueue();

            self.owner.store(ThreadId::NONE_RAW, Ordering::SeqCst);
            self.entry_cv.notify_one();

            loop {
                if set.take_notified(ticket) {
                    break WaitStatus::Notified;
                }
                match deadline {
                    None => self.wait_cv.wait(&mut set),
                    Some(deadline) => {
                        if self.wait_cv.wait_until(&mut set, deadline).timed_out() {
                            if set.take_notified(ticket) {
                                break WaitStatus::Notified;
                            }
                            set.cancel(ticket);
                            break WaitStatus::TimedOut;
                        }
                    }
                }
            }
        };

        self.add_contender();
        self.enter_contended(me);
        self.recursions.store(saved_recursions, Ordering::Relaxed);
        self.waiters.fetch_sub(1, Ordering::SeqCst);

        Ok(status)
    }

    pub(crate) fn notify(&self, me: ThreadId) -> Result<()> {
        crate::ensure_owner!(
            self.is_owned_by(me),
            "notify",
            "thread {} does not own monitor",
            me
        );
        let mut set = self.wait_set.lock();
        if set.notify_one() {
            self.wait_cv.notify_all();
        }
        Ok(())
    }

    pub(crate) fn notify_all(&self, me: ThreadId) -> Result<()> {
        crate::ensure_owner!(
            self.is_owned_by(me),
            "notify_all",
            "thread {} does not own monitor",
            me
        );
        let mut set = self.wait_set.lock();
        if set.notify_all() > 0 {
            self.wait_cv.notify_all();
        }
        Ok(())
    }

    /// Return to the pristine free state
    pub(crate) fn reset(&self) {
        self.header.store(LockWord::NEUTRAL.raw(), Ordering::Release);
        self.owner.store(ThreadId::NONE_RAW, Ordering::SeqCst);
        self.recursions.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ObjectMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectMonitor")
            .field("address", &crate::util::format_address(self.address()))
            .field("object", &crate::util::format_address(self.object_address()))
            .field("header", &self.header())
            .field("owner", &self.owner())
            .field("recursions", &self.recursions())
            .field("waiters", &self.waiters())
            .field("contentions", &self.contentions())
            .finish()
    }
}
