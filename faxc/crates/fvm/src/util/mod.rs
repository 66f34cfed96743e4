//! Util Module - Shared Utilities
//!
//! Utilities and helper functions used throughout FVM.

pub mod atomic;
pub mod debug;

pub use atomic::{AtomicUtils, SpinWait};
pub use debug::format_address;

/// Constants for FVM
pub mod constants {
    /// Spin iterations before a waiter starts yielding
    pub const SPIN_LIMIT: u32 = 6;
    /// Yield iterations before a waiter starts sleeping
    pub const YIELD_LIMIT: u32 = 10;
    /// Longest sleep between polls once a waiter parks
    pub const MAX_PARK_US: u64 = 1000;
    /// Stack locks one thread can hold before further locks go to monitors
    pub const LOCK_STACK_CAPACITY: usize = 16;
    /// Cache line alignment: 64 bytes
    pub const CACHE_LINE_ALIGNMENT: usize = 64;
}
