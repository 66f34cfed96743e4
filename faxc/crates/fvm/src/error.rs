//! Error Module - FVM Error Types
//!
//! Defines all error types used in FVM.
//!
//! # Error Categories
//!
//! ## Caller Errors (recoverable)
//! - `IllegalLockState` - exit/wait/notify by a thread that does not own the lock
//! - `ThreadTerminated` - operation attempted through a detached thread
//! - `Configuration` - invalid configuration
//!
//! ## Infrastructure Errors (fatal)
//! - `ProtocolTimeout` - a safepoint or handshake missed its deadline
//! - `ResourceExhausted` - no memory left to carve a monitor block
//! - `InvariantViolation` - the monitor audit found a count or structure mismatch
//! - `NestedOperation` - the coordinator was asked to nest an operation illegally
//!
//! Fatal errors never reach a caller under [`FatalPolicy::Abort`]; under
//! [`FatalPolicy::Intercept`] they arrive wrapped in `FatalProtocolViolation`.
//!
//! [`FatalPolicy::Abort`]: crate::config::FatalPolicy::Abort
//! [`FatalPolicy::Intercept`]: crate::config::FatalPolicy::Intercept

use crate::thread::ThreadId;
use thiserror::Error;

/// Main error type for all FVM operations
///
/// # Examples
///
/// ```rust
/// use fvm::error::FvmError;
///
/// fn handle_error(err: FvmError) {
///     match err {
///         FvmError::IllegalLockState { operation, reason } => {
///             eprintln!("{} rejected: {}", operation, reason);
///         }
///         other if other.is_fatal() => panic!("engine failure: {}", other),
///         other => eprintln!("error: {}", other),
///     }
/// }
/// ```
#[derive(Debug, Clone, Error)]
pub enum FvmError {
    /// Lock misuse by the caller
    ///
    /// **When returned:** `exit`, `wait`, `notify` or `notify_all` on an object
    /// the calling thread does not own.
    ///
    /// **Recovery strategy:** Caller bug; report it as a normal error value.
    #[error("Illegal lock state in {operation}: {reason}")]
    IllegalLockState {
        operation: &'static str,
        reason: String,
    },

    /// Safepoint or handshake deadline exceeded
    ///
    /// **When returned:** Some mutator never reached a safe state within
    /// `safepoint_timeout_ms` / `handshake_timeout_ms`.
    ///
    /// **Recovery strategy:** None. Fatal.
    #[error("{protocol} timed out after {elapsed_ms}ms waiting for threads {pending_threads:?}")]
    ProtocolTimeout {
        protocol: &'static str,
        elapsed_ms: u64,
        pending_threads: Vec<ThreadId>,
    },

    /// Resource exhausted
    ///
    /// **When returned:** The system allocator refused a new monitor block.
    ///
    /// **Recovery strategy:** None. Fatal.
    #[error("Resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    /// Internal invariant violated
    ///
    /// **When returned:** Monitor audit detected count/structure mismatches,
    /// or a busy/bound monitor was released.
    ///
    /// **Recovery strategy:** None. This is a bug.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Illegal nested VM operation
    ///
    /// **When returned:** The coordinator submitted an operation while running
    /// one that does not allow nesting.
    #[error("Operation '{inner}' cannot nest inside '{outer}'")]
    NestedOperation { outer: String, inner: String },

    /// Intercepted fatal error
    ///
    /// **When returned:** A fatal error happened while the runtime runs with
    /// `FatalPolicy::Intercept`. The runtime is unusable afterwards.
    #[error("Fatal protocol violation: {0}")]
    FatalProtocolViolation(Box<FvmError>),

    /// Configuration error
    ///
    /// **Example scenarios:**
    /// - Threshold outside 0..=100
    /// - Monitor block too small to hold the link slot
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid state
    ///
    /// **Example scenario:** Submitting to a runtime that was never started
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The thread was detached before the operation
    #[error("Thread {0} has terminated")]
    ThreadTerminated(ThreadId),

    /// The runtime is shutting down and accepts no more operations
    #[error("Runtime is shut down")]
    Shutdown,
}

impl FvmError {
    /// Build an `IllegalLockState` error
    pub fn illegal_lock(operation: &'static str, reason: impl Into<String>) -> Self {
        FvmError::IllegalLockState {
            operation,
            reason: reason.into(),
        }
    }

    /// Check if this error is fatal for the engine
    ///
    /// Fatal errors are never recovered from: every other subsystem relies on
    /// the engine's invariants holding unconditionally.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FvmError::ProtocolTimeout { .. }
                | FvmError::ResourceExhausted { .. }
                | FvmError::InvariantViolation(_)
                | FvmError::NestedOperation { .. }
                | FvmError::FatalProtocolViolation(_)
        )
    }

    /// Check if this error is a caller mistake that can be reported and survived
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FvmError::IllegalLockState { .. }
                | FvmError::ThreadTerminated(_)
                | FvmError::Configuration(_)
        )
    }

    /// Unwrap an intercepted fatal error to its cause
    pub fn root_cause(&self) -> &FvmError {
        match self {
            FvmError::FatalProtocolViolation(inner) => inner.root_cause(),
            other => other,
        }
    }
}

impl From<crate::config::ConfigError> for FvmError {
    fn from(err: crate::config::ConfigError) -> Self {
        FvmError::Configuration(err.to_string())
    }
}

/// Result type alias for FVM operations
pub type Result<T> = std::result::Result<T, FvmError>;

/// Return an `IllegalLockState` error unless `cond` holds
#[macro_export]
macro_rules! ensure_owner {
    ($cond:expr, $operation:expr, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::error::FvmError::illegal_lock($operation, format!($($arg)*)));
        }
    };
}
