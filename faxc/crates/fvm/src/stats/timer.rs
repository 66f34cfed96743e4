//! VM Timer - Timing Utilities
//!
//! Utility for timing safepoint phases and operations.

use std::time::{Duration, Instant};

/// VmTimer - timer for measuring coordinator phases
pub struct VmTimer {
    start: Instant,
}

impl VmTimer {
    /// Create new timer
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Timer that started at `start`
    pub fn since(start: Instant) -> Self {
        Self { start }
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Get elapsed microseconds
    pub fn elapsed_us(&self) -> u64 {
        self.elapsed().as_micros() as u64
    }

    /// Get elapsed milliseconds
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }
}

impl Default for VmTimer {
    fn default() -> Self {
        Self::new()
    }
}
