//! Fatal Error Handling
//!
//! Infrastructure failures (protocol timeouts, exhausted monitor memory,
//! broken list invariants, illegal nesting) leave the engine in a state no
//! caller can repair. Every one of them is routed through `FatalHandler`,
//! which logs a per-thread state dump and then, depending on
//! [`FatalPolicy`]:
//!
//! - `Abort`: terminates the process
//! - `Intercept`: latches the runtime as failed and hands back
//!   `FvmError::FatalProtocolViolation`, which every later request returns

use crate::config::FatalPolicy;
use crate::error::{FvmError, Result};
use crate::logging::{VmEvent, VmLogger};
use crate::thread::ThreadList;
use parking_lot::Mutex;
use std::fmt::Write;
use std::sync::Arc;

/// FatalHandler - single sink for unrecoverable errors
pub struct FatalHandler {
    policy: FatalPolicy,
    threads: Arc<ThreadList>,
    logger: Arc<VmLogger>,
    failure: Mutex<Option<FvmError>>,
}

impl FatalHandler {
    pub fn new(policy: FatalPolicy, threads: Arc<ThreadList>, logger: Arc<VmLogger>) -> Self {
        Self {
            policy,
            threads,
            logger,
            failure: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> FatalPolicy {
        self.policy
    }

    /// Report a fatal error
    ///
    /// Under `Abort` this does not return. Under `Intercept` the first error
    /// is latched and every call returns the latched error.
    pub fn handle(&self, err: FvmError) -> FvmError {
        if let FvmError::ProtocolTimeout {
            protocol,
            elapsed_ms,
            pending_threads,
        } = &err
        {
            self.logger.log(VmEvent::Timeout {
                protocol: protocol.to_string(),
                elapsed_ms: *elapsed_ms,
                pending: pending_threads.len(),
            });
        }

        log::error!("[VM] Fatal: {}", err);
        log::error!("[VM] Thread states:\n{}", self.thread_dump());

        if self.policy == FatalPolicy::Abort {
            std::process::abort();
        }

        let mut failure = self.failure.lock();
        failure
            .get_or_insert_with(|| match err {
                err @ FvmError::FatalProtocolViolation(_) => err,
                err => FvmError::FatalProtocolViolation(Box::new(err)),
            })
            .clone()
    }

    /// The latched failure, if any
    pub fn latched(&self) -> Option<FvmError> {
        self.failure.lock().clone()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    /// `Err` with the latched failure once the runtime has failed
    pub fn check(&self) -> Result<()> {
        match self.latched() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// One line per attached thread: id, name, state, pending handshake,
    /// stack locks held
    pub fn thread_dump(&self) -> String {
        let mut out = String::new();
        for thread in self.threads.snapshot() {
            let _ = writeln!(
                out,
                "  {} '{}' state={:?} handshake_pending={} stack_locks={}",
                thread.id(),
                thread.name(),
                thread.state(),
                thread.has_pending_handshake(),
                thread.stack_lock_count()
            );
        }
        if out.is_empty() {
            out.push_str("  (no attached threads)\n");
        }
        out
    }
}

impl std::fmt::Debug for FatalHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FatalHandler")
            .field("policy", &self.policy)
            .field("failed", &self.is_failed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{MutatorThread, ThreadId};

    #[test]
    fn test_intercept_latches_first_error() {
        let handler = FatalHandler::new(
            FatalPolicy::Intercept,
            Arc::new(ThreadList::new()),
            Arc::new(VmLogger::default()),
        );
        assert!(handler.check().is_ok());

        let first = handler.handle(FvmError::InvariantViolation("count".into()));
        let second = handler.handle(FvmError::ResourceExhausted {
            resource: "monitor block".into(),
        });

        assert!(matches!(first, FvmError::FatalProtocolViolation(_)));
        assert!(matches!(
            second.root_cause(),
            FvmError::InvariantViolation(_)
        ));
        assert!(handler.is_failed());
        assert!(handler.check().is_err());
    }

    #[test]
    fn test_timeout_is_logged() {
        let logger = Arc::new(VmLogger::default());
        let handler = FatalHandler::new(
            FatalPolicy::Intercept,
            Arc::new(ThreadList::new()),
            Arc::clone(&logger),
        );

        handler.handle(FvmError::ProtocolTimeout {
            protocol: "handshake",
            elapsed_ms: 5,
            pending_threads: vec![ThreadId::from_raw(2)],
        });

        assert_eq!(
            logger.count_matching(|e| matches!(e, VmEvent::Timeout { pending: 1, .. })),
            1
        );
    }

    #[test]
    fn test_thread_dump_lists_threads() {
        let threads = Arc::new(ThreadList::new());
        threads.add(Arc::new(MutatorThread::new(ThreadId::from_raw(4), "worker", 1)));
        let handler = FatalHandler::new(
            FatalPolicy::Intercept,
            threads,
            Arc::new(VmLogger::default()),
        );

        let dump = handler.thread_dump();
        assert!(dump.contains("#4"));
        assert!(dump.contains("worker"));
        assert!(dump.contains("Blocked"));
    }
}
