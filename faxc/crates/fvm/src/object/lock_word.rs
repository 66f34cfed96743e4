//! Lock Word - per-object lock state encoding
//!
//! Lock Word Layout (one machine word):
//! ┌──────────────────────────────────────────┬─────────┐
//! │ Neutral:       hash (bits 8..39)         │ tag 01  │
//! │ Stack-locked:  address of LockRecord     │ tag 00  │
//! │ Inflating:     all zero (sentinel)       │ tag 00  │
//! │ Inflated:      address of ObjectMonitor  │ tag 10  │
//! └──────────────────────────────────────────┴─────────┘
//!
//! Lock records and monitors are at least 8-byte aligned, so the two low
//! bits are free for the tag. The inflating sentinel is the only word that
//! is ever literally zero.

use crate::monitor::ObjectMonitor;

/// Tag bits
pub const TAG_MASK: usize = 0b11;
pub const TAG_LOCKED: usize = 0b00;
pub const TAG_NEUTRAL: usize = 0b01;
pub const TAG_MONITOR: usize = 0b10;
pub const TAG_UNUSED: usize = 0b11;

/// Identity hash field
pub const HASH_SHIFT: usize = 8;
pub const HASH_BITS: usize = 31;
pub const HASH_MASK: usize = ((1usize << HASH_BITS) - 1) << HASH_SHIFT;

/// Observable lock state of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Neutral,
    StackLocked,
    Inflating,
    Inflated,
}

/// Decoded lock word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    Neutral { hash: u32 },
    StackLocked { record: usize },
    Inflating,
    Inflated { monitor: *const ObjectMonitor },
}

/// LockWord - immutable view of one lock word value
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct LockWord(usize);

impl LockWord {
    /// Transient value installed while a thread builds a monitor
    pub const INFLATING: LockWord = LockWord(0);

    /// Never-locked object without a hash
    pub const NEUTRAL: LockWord = LockWord(TAG_NEUTRAL);

    /// Displaced-header value meaning "this record does not own a stack lock"
    ///
    /// Stored in a lock record whose enter went through the monitor; its exit
    /// must take the inflated path.
    pub const UNUSED: LockWord = LockWord(TAG_UNUSED);

    /// Displaced-header value of a recursive stack lock
    pub const RECURSIVE: LockWord = LockWord(0);

    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Stack-locked word pointing at the record at `addr`
    #[inline]
    pub fn stack_locked(addr: usize) -> Self {
        debug_assert!(addr != 0 && addr & TAG_MASK == 0, "misaligned lock record");
        Self(addr)
    }

    /// Inflated word pointing at `monitor`
    #[inline]
    pub fn inflated(monitor: &ObjectMonitor) -> Self {
        let addr = monitor as *const ObjectMonitor as usize;
        debug_assert!(addr & TAG_MASK == 0, "misaligned monitor");
        Self(addr | TAG_MONITOR)
    }

    /// Neutral word carrying `hash` (0 = no hash)
    #[inline]
    pub fn neutral_with_hash(hash: u32) -> Self {
        Self((((hash as usize) << HASH_SHIFT) & HASH_MASK) | TAG_NEUTRAL)
    }

    #[inline]
    pub fn decode(self) -> Decoded {
        match self.0 & TAG_MASK {
            TAG_NEUTRAL => Decoded::Neutral { hash: self.hash() },
            TAG_MONITOR => Decoded::Inflated {
                monitor: (self.0 & !TAG_MASK) as *const ObjectMonitor,
            },
            TAG_LOCKED if self.0 == 0 => Decoded::Inflating,
            TAG_LOCKED => Decoded::StackLocked { record: self.0 },
            // TAG_UNUSED never appears in an object header
            _ => Decoded::Inflating,
        }
    }

    #[inline]
    pub fn state(self) -> LockState {
        match self.decode() {
            Decoded::Neutral { .. } => LockState::Neutral,
            Decoded::StackLocked { .. } => LockState::StackLocked,
            Decoded::Inflating => LockState::Inflating,
            Decoded::Inflated { .. } => LockState::Inflated,
        }
    }

    #[inline]
    pub fn is_neutral(self) -> bool {
        self.0 & TAG_MASK == TAG_NEUTRAL
    }

    /// Identity hash, 0 if none installed or the word is not neutral
    #[inline]
    pub fn hash(self) -> u32 {
        if self.is_neutral() {
            ((self.0 & HASH_MASK) >> HASH_SHIFT) as u32
        } else {
            0
        }
    }

    #[inline]
    pub fn has_hash(self) -> bool {
        self.hash() != 0
    }

    /// Copy of a neutral word with `hash` installed
    #[inline]
    pub fn with_hash(self, hash: u32) -> Self {
        debug_assert!(self.is_neutral());
        Self((self.0 & !HASH_MASK) | (((hash as usize) << HASH_SHIFT) & HASH_MASK))
    }
}

impl std::fmt::Debug for LockWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LockWord({:?}, {:#x})", self.state(), self.0)
    }
}

/// Mask a random value into a valid non-zero hash
pub fn normalize_hash(value: u32) -> u32 {
    match value & ((1u32 << HASH_BITS) - 1) {
        0 => 0x5EED,
        h => h,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neutral_hash_roundtrip() {
        let word = LockWord::NEUTRAL.with_hash(0x1234_5678 & 0x7FFF_FFFF);
        assert!(word.is_neutral());
        assert_eq!(word.hash(), 0x1234_5678 & 0x7FFF_FFFF);
        assert_eq!(word.state(), LockState::Neutral);
        assert_eq!(LockWord::neutral_with_hash(0), LockWord::NEUTRAL);
    }

    #[test]
    fn test_sentinel_is_only_zero_word() {
        assert_eq!(LockWord::INFLATING.state(), LockState::Inflating);
        assert_eq!(LockWord::stack_locked(0x1000).state(), LockState::StackLocked);
        assert_eq!(
            LockWord::from_raw(0x1000 | TAG_MONITOR).state(),
            LockState::Inflated
        );
    }

    #[test]
    fn test_non_neutral_has_no_hash() {
        assert_eq!(LockWord::stack_locked(0x1000).hash(), 0);
    }

    #[test]
    fn test_normalize_hash_never_zero() {
        assert_ne!(normalize_hash(0), 0);
        assert_ne!(normalize_hash(1u32 << 31), 0);
        assert!(normalize_hash(u32::MAX) < (1u32 << HASH_BITS));
    }
}
