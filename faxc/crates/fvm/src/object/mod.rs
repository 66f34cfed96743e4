//! Object Module - Lockable Runtime Objects
//!
//! The engine only needs one word of an object: its lock word. Everything
//! else about the object model belongs to the surrounding runtime.
//!
//! Objects are shared as `ObjectRef` (`Arc<ManagedObject>`). A monitor bound
//! to an object holds one strong reference to it until deflation, so the
//! back-pointer never dangles.

pub mod lock_record;
pub mod lock_word;

pub use lock_record::LockRecord;
pub use lock_word::{Decoded, LockState, LockWord};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared handle to a lockable object
pub type ObjectRef = Arc<ManagedObject>;

/// ManagedObject - anything that can be synchronized on
#[repr(C, align(8))]
pub struct ManagedObject {
    lock_word: AtomicUsize,
}

impl ManagedObject {
    /// Fresh, never-locked object
    pub fn new() -> Self {
        Self {
            lock_word: AtomicUsize::new(LockWord::NEUTRAL.raw()),
        }
    }

    /// Fresh object behind an `ObjectRef`
    pub fn new_ref() -> ObjectRef {
        Arc::new(Self::new())
    }

    #[inline]
    pub fn address(&self) -> usize {
        self as *const ManagedObject as usize
    }

    #[inline]
    pub fn lock_word(&self) -> LockWord {
        LockWord::from_raw(self.lock_word.load(Ordering::Acquire))
    }

    #[inline]
    pub fn lock_state(&self) -> LockState {
        self.lock_word().state()
    }

    #[inline]
    pub(crate) fn cas_lock_word(&self, current: LockWord, new: LockWord) -> Result<(), LockWord> {
        self.lock_word
            .compare_exchange(current.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(LockWord::from_raw)
    }

    /// Unconditional store; only legal for the thread holding the sentinel,
    /// or for the coordinator at a safepoint
    #[inline]
    pub(crate) fn store_lock_word(&self, word: LockWord) {
        self.lock_word.store(word.raw(), Ordering::Release);
    }
}

impl Default for ManagedObject {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ManagedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedObject")
            .field("address", &crate::util::format_address(self.address()))
            .field("lock_word", &self.lock_word())
            .finish()
    }
}
