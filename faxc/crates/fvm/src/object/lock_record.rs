//! Lock Record - the stack-resident half of a lightweight lock
//!
//! A `LockRecord` lives in the locking thread's frame for as long as the lock
//! is held. Its address is what a stack-locked lock word points at, so it
//! must not move: callers pin it.
//!
//! ```rust
//! use std::pin::pin;
//! use fvm::object::LockRecord;
//!
//! let record = pin!(LockRecord::new());
//! assert_eq!(record.as_ref().address() % 8, 0);
//! ```

use super::lock_word::LockWord;
use crate::thread::ThreadId;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// LockRecord - displaced lock word plus owner identity
#[repr(C, align(8))]
pub struct LockRecord {
    /// Neutral word displaced by the stack lock, `RECURSIVE` for a nested
    /// stack lock, `UNUSED` when the enter went through a monitor
    displaced: AtomicUsize,
    owner: AtomicU64,
    _pin: PhantomPinned,
}

impl LockRecord {
    pub const fn new() -> Self {
        Self {
            displaced: AtomicUsize::new(LockWord::UNUSED.raw()),
            owner: AtomicU64::new(ThreadId::NONE_RAW),
            _pin: PhantomPinned,
        }
    }

    /// Address stored in a stack-locked lock word
    #[inline]
    pub fn address(self: Pin<&Self>) -> usize {
        self.get_ref() as *const LockRecord as usize
    }

    #[inline]
    pub fn displaced_header(&self) -> LockWord {
        LockWord::from_raw(self.displaced.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_displaced_header(&self, word: LockWord) {
        self.displaced.store(word.raw(), Ordering::Release);
    }

    #[inline]
    pub fn owner(&self) -> Option<ThreadId> {
        ThreadId::from_owner_field(self.owner.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_owner(&self, owner: ThreadId) {
        self.owner.store(owner.as_u64(), Ordering::Release);
    }

    /// Whether the record was used for a recursive stack lock
    #[inline]
    pub fn is_recursive(&self) -> bool {
        self.displaced_header() == LockWord::RECURSIVE
    }

    /// Reinterpret a stack-locked word's address as a record
    ///
    /// # Safety
    /// `addr` must come from a stack-locked lock word that the caller has
    /// pinned (by owning the lock or by holding the inflating sentinel), so the
    /// owner cannot pop the record while it is read.
    #[inline]
    pub(crate) unsafe fn from_address<'a>(addr: usize) -> &'a LockRecord {
        &*(addr as *const LockRecord)
    }
}

impl Default for LockRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRecord")
            .field("displaced", &self.displaced_header())
            .field("owner", &self.owner())
            .finish()
    }
}

impl Drop for LockRecord {
    fn drop(&mut self) {
        // A stack-locked word or the owner's record list may still name this
        // address; neither may outlive the frame.
        if self.displaced_header().is_neutral() {
            log::error!(
                "lock record {:p} dropped while its stack lock is held",
                self as *const LockRecord
            );
            std::process::abort();
        }
    }
}
