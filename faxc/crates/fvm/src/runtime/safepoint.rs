//! Safepoint Protocol
//!
//! Coordinator side:
//! ```text
//! Idle ──begin──▶ Synchronizing ──all threads safe──▶ Synchronized ──end──▶ Idle
//! ```
//!
//! Mutator side: a thread running managed code is never implicitly safe. It
//! reaches a checkpoint (`poll`) or a state transition, sees the armed flag and
//! parks as `Blocked` until the coordinator releases the safepoint.
//!
//! Ordering: the mutator stores its state and then loads the armed flag; the
//! coordinator stores the armed flag and then loads thread states. All four
//! accesses are `SeqCst`, so at least one side observes the other.

use crate::error::{FvmError, Result};
use crate::stats::VmTimer;
use crate::thread::{MutatorThread, ThreadList, ThreadState};
use crate::util::SpinWait;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

/// Coordinator-side safepoint state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SafepointState {
    Idle = 0,
    Synchronizing = 1,
    Synchronized = 2,
}

impl SafepointState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SafepointState::Synchronizing,
            2 => SafepointState::Synchronized,
            _ => SafepointState::Idle,
        }
    }
}

impl std::fmt::Display for SafepointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SafepointState::Idle => "idle",
            SafepointState::Synchronizing => "synchronizing",
            SafepointState::Synchronized => "synchronized",
        };
        f.write_str(name)
    }
}

/// Timing of one synchronization
#[derive(Debug, Clone, Copy)]
pub struct SyncReport {
    pub safepoint_id: u64,
    pub threads: usize,
    pub time_to_safepoint: Duration,
}

/// Safepoint - global poll flag and release barrier
pub struct Safepoint {
    armed: AtomicBool,
    state: AtomicU8,
    safepoint_id: AtomicU64,
    release_lock: Mutex<()>,
    released: Condvar,
}

impl Safepoint {
    pub fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            state: AtomicU8::new(SafepointState::Idle as u8),
            safepoint_id: AtomicU64::new(0),
            release_lock: Mutex::new(()),
            released: Condvar::new(),
        }
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn state(&self) -> SafepointState {
        SafepointState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_synchronized(&self) -> bool {
        self.state() == SafepointState::Synchronized
    }

    /// Id of the current or most recent safepoint
    pub fn safepoint_id(&self) -> u64 {
        self.safepoint_id.load(Ordering::Acquire)
    }

    // ========================================================================
    // COORDINATOR SIDE
    // ========================================================================

    /// Arm the poll and wait until every listed thread is safe
    ///
    /// On timeout the safepoint stays armed; the caller decides between abort
    /// and `end`.
    pub(crate) fn begin(
        &self,
        threads: &ThreadList,
        timeout: Option<Duration>,
    ) -> Result<SyncReport> {
        let timer = VmTimer::new();
        let safepoint_id = self.safepoint_id.fetch_add(1, Ordering::AcqRel) + 1;

        self.state
            .store(SafepointState::Synchronizing as u8, Ordering::Release);
        self.armed.store(true, Ordering::SeqCst);

        let mut spin = SpinWait::new();
        loop {
            let snapshot = threads.snapshot();
            let pending: Vec<_> = snapshot
                .iter()
                .filter(|t| !t.is_safe_for_global_operation())
                .map(|t| t.id())
                .collect();

            if pending.is_empty() {
                self.state
                    .store(SafepointState::Synchronized as u8, Ordering::Release);
                return Ok(SyncReport {
                    safepoint_id,
                    threads: snapshot.len(),
                    time_to_safepoint: timer.elapsed(),
                });
            }

            if let Some(limit) = timeout {
                if timer.elapsed() >= limit {
                    return Err(FvmError::ProtocolTimeout {
                        protocol: "safepoint",
                        elapsed_ms: timer.elapsed_ms(),
                        pending_threads: pending,
                    });
                }
            }

            spin.snooze();
        }
    }

    /// Disarm and wake every parked thread
    pub(crate) fn end(&self) {
        {
            let _guard = self.release_lock.lock();
            self.armed.store(false, Ordering::SeqCst);
            self.state.store(SafepointState::Idle as u8, Ordering::Release);
        }
        self.released.notify_all();
    }

    // ========================================================================
    // MUTATOR SIDE
    // ========================================================================

    /// Park until the current safepoint is released
    fn wait_for_release(&self) {
        let mut guard = self.release_lock.lock();
        while self.armed.load(Ordering::SeqCst) {
            self.released.wait(&mut guard);
        }
    }

    /// Checkpoint: block while a safepoint is in progress
    pub(crate) fn poll(&self, thread: &MutatorThread) {
        if self.is_armed() {
            thread.set_state(ThreadState::Blocked);
            self.transition_to_managed(thread);
        }
    }

    /// Leave a safe state and resume managed execution
    ///
    /// Does not return while a safepoint is armed, or while the coordinator
    /// is running a handshake on this thread's behalf.
    pub(crate) fn transition_to_managed(&self, thread: &MutatorThread) {
        loop {
            thread.set_state(ThreadState::InManaged);
            if !self.is_armed() {
                break;
            }
            thread.set_state(ThreadState::Blocked);
            self.wait_for_release();
        }
        thread.handshake().wait_until_idle();
    }

    /// Run `f` with the thread counted as safe
    ///
    /// A thread that was already in a safe state (native code) goes back to
    /// it; only a managed thread goes through `transition_to_managed`.
    pub(crate) fn blocked<R>(&self, thread: &MutatorThread, f: impl FnOnce() -> R) -> R {
        let previous = thread.swap_state(ThreadState::Blocked);
        let result = f();
        if previous.is_safe_for_global_operation() {
            thread.set_state(previous);
        } else {
            self.transition_to_managed(thread);
        }
        result
    }

    pub(crate) fn enter_safe_state(&self, thread: &MutatorThread, state: ThreadState) {
        debug_assert!(state.is_safe_for_global_operation());
        thread.set_state(state);
    }
}

impl Default for Safepoint {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadId;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    fn mutator(id: u64) -> Arc<MutatorThread> {
        let thread = Arc::new(MutatorThread::new(ThreadId::from_raw(id), "sp-test", 4));
        thread.set_state(ThreadState::InManaged);
        thread
    }

    #[test]
    fn test_begin_with_safe_threads() {
        let safepoint = Safepoint::new();
        let threads = ThreadList::new();
        let t = mutator(1);
        t.set_state(ThreadState::InNativeNoStack);
        threads.add(t);

        let report = safepoint.begin(&threads, None).unwrap();
        assert_eq!(report.safepoint_id, 1);
        assert!(safepoint.is_synchronized());
        safepoint.end();
        assert_eq!(safepoint.state(), SafepointState::Idle);
        assert!(!safepoint.is_armed());
    }

    #[test]
    fn test_begin_times_out_on_running_thread() {
        let safepoint = Safepoint::new();
        let threads = ThreadList::new();
        threads.add(mutator(7));

        let err = safepoint
            .begin(&threads, Some(Duration::from_millis(20)))
            .unwrap_err();
        match err {
            FvmError::ProtocolTimeout {
                protocol,
                pending_threads,
                ..
            } => {
                assert_eq!(protocol, "safepoint");
                assert_eq!(pending_threads, vec![ThreadId::from_raw(7)]);
            }
            other => panic!("unexpected {:?}", other),
        }
        safepoint.end();
    }

    #[test]
    fn test_polling_thread_parks_until_end() {
        let safepoint = Arc::new(Safepoint::new());
        let threads = Arc::new(ThreadList::new());
        let t = mutator(1);
        threads.add(Arc::clone(&t));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let (safepoint, t, stop) = (Arc::clone(&safepoint), Arc::clone(&t), Arc::clone(&stop));
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    safepoint.poll(&t);
                    std::hint::spin_loop();
                }
            })
        };

        safepoint.begin(&threads, Some(Duration::from_secs(5))).unwrap();
        assert!(crate::util::AtomicUtils::spin_wait(
            || t.state() == ThreadState::Blocked,
            10_000
        ));
        safepoint.end();

        stop.store(true, Ordering::SeqCst);
        worker.join().unwrap();
        assert_eq!(t.state(), ThreadState::InManaged);
    }
}
