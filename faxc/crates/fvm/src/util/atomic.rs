//! Atomic Utilities
//!
//! Helper functions for atomic operations and spin-then-yield-then-park
//! waiting, used by the coordinator while it waits for mutators and by
//! threads that find an object in the middle of inflation.

use super::constants::{MAX_PARK_US, SPIN_LIMIT, YIELD_LIMIT};
use crossbeam::utils::Backoff;
use std::time::Duration;

/// AtomicUtils - utility for atomic operations
pub struct AtomicUtils;

impl AtomicUtils {
    /// Spin until `condition` holds or `max_rounds` backoff rounds elapse
    pub fn spin_wait<F>(mut condition: F, max_rounds: usize) -> bool
    where
        F: FnMut() -> bool,
    {
        let mut wait = SpinWait::new();
        let mut rounds = 0;

        while !condition() {
            if rounds >= max_rounds {
                return false;
            }
            wait.snooze();
            rounds += 1;
        }

        true
    }
}

/// SpinWait - escalating wait strategy
///
/// Spins with exponential backoff first, then yields the CPU, then sleeps
/// for a growing interval capped at `MAX_PARK_US`. Single-CPU machines skip
/// spinning: the thread being waited on cannot run while we spin.
pub struct SpinWait {
    backoff: Backoff,
    rounds: u32,
    park_us: u64,
    multi_core: bool,
}

impl SpinWait {
    pub fn new() -> Self {
        Self {
            backoff: Backoff::new(),
            rounds: 0,
            park_us: 10,
            multi_core: num_cpus::get() > 1,
        }
    }

    /// Wait one round
    pub fn snooze(&mut self) {
        self.rounds = self.rounds.saturating_add(1);

        if self.multi_core && self.rounds <= SPIN_LIMIT {
            self.backoff.spin();
        } else if self.rounds <= SPIN_LIMIT + YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_micros(self.park_us));
            self.park_us = (self.park_us * 2).min(MAX_PARK_US);
        }
    }

    /// Whether the waiter has escalated to sleeping
    pub fn is_parking(&self) -> bool {
        self.rounds > SPIN_LIMIT + YIELD_LIMIT
    }

    /// Start over from spinning
    pub fn reset(&mut self) {
        self.backoff.reset();
        self.rounds = 0;
        self.park_us = 10;
    }
}

impl Default for SpinWait {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spin_wait_gives_up() {
        assert!(!AtomicUtils::spin_wait(|| false, 20));
        assert!(AtomicUtils::spin_wait(|| true, 0));
    }

    #[test]
    fn test_spin_wait_escalates_to_parking() {
        let mut wait = SpinWait::new();
        for _ in 0..(SPIN_LIMIT + YIELD_LIMIT + 1) {
            wait.snooze();
        }
        assert!(wait.is_parking());
        wait.reset();
        assert!(!wait.is_parking());
    }
}
