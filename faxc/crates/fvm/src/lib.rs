//! # FVM - Safepoint and Object Lock Engine for the Fax VM
//!
//! FVM is the cooperative-quiescence and lock-lifecycle core of the Fax
//! managed runtime. It brings every mutator thread to a pausable state before
//! running global operations, runs per-thread handshakes without a global
//! stop, and implements adaptive object locks that start as stack records and
//! are promoted to heavyweight monitors only under contention.
//!
//! ## Overview
//!
//! - **Safepoints**: one coordinator thread executes VM operations; operations
//!   that need the world stopped arm a global poll and wait for every mutator
//!   to report a safe state. Queued safepoint operations are coalesced into
//!   one pause.
//! - **Handshakes**: a closure armed in one thread's slot, run either by the
//!   thread at its next poll or by the coordinator while the thread is
//!   provably blocked or in native code.
//! - **Adaptive locks**: neutral → stack-locked → inflated, with monitors
//!   carved in blocks and recycled through lock-free free/in-use lists.
//!   Idle monitors are deflated at safepoints.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fvm::{FnOperation, LockRecord, ManagedObject, Runtime, VmConfig};
//! use std::pin::pin;
//!
//! fn main() -> Result<(), fvm::FvmError> {
//!     let runtime = Runtime::with_config(VmConfig::default())?;
//!     let mutator = runtime.attach_thread("main")?;
//!
//!     let object = ManagedObject::new_ref();
//!     let record = pin!(LockRecord::new());
//!     mutator.enter(&object, record.as_ref())?;
//!     let hash = mutator.identity_hash(&object)?;
//!     mutator.exit(&object, record.as_ref())?;
//!     assert_eq!(hash, mutator.identity_hash(&object)?);
//!
//!     // Runs with every other mutator stopped
//!     mutator.submit(FnOperation::safepoint("inspect", |ctx| {
//!         assert!(ctx.is_at_safepoint());
//!         Ok(())
//!     }).into_arc())?;
//!
//!     mutator.detach();
//!     runtime.stop()
//! }
//! ```
//!
//! ## Lock Word Layout
//!
//! ```text
//! ┌──────────────────────────────────────────┬─────┐
//! │  payload                                 │ tag │
//! └──────────────────────────────────────────┴─────┘
//!   01  neutral        payload = identity hash (bits 8..39)
//!   00  stack-locked   payload = lock record address (0 = inflating)
//!   10  inflated       payload = monitor address
//! ```
//!
//! ## Thread Safety
//!
//! - `Runtime` is `Send + Sync`; operations may be submitted from any thread
//! - A `MutatorHandle` belongs to the thread that attached it
//! - `LockRecord`s must stay pinned in the locking frame until the matching exit
//!
//! ## Modules
//!
//! - [`config`]: tuning parameters and validation
//! - [`error`]: error types and fatal classification
//! - [`fatal`]: abort-or-intercept handling of fatal errors
//! - [`logging`]: structured engine events
//! - [`monitor`]: monitors, their lists and the registry
//! - [`object`]: lock words, lock records and managed objects
//! - [`runtime`]: coordinator, operations, safepoints and handshakes
//! - [`stats`]: counters and pause histograms
//! - [`sync`]: the object lock state machine
//! - [`thread`]: mutator thread records
//! - [`util`]: backoff and formatting helpers

// Configuration and errors
pub mod config;
pub mod error;
pub mod fatal;

// Lock subsystem
pub mod monitor;
pub mod object;
pub mod sync;

// Coordination
pub mod runtime;
pub mod thread;

// Monitoring
pub mod logging;
pub mod stats;

// Utilities
pub mod util;

// Re-export main types for convenience
pub use config::{FatalPolicy, VmConfig};
pub use error::{FvmError, Result};
pub use monitor::{AuditReport, MonitorRegistry, ObjectMonitor};
pub use object::{LockRecord, LockWord, ManagedObject, ObjectRef};
pub use runtime::{
    FnOperation, Handshake, MutatorHandle, OperationContext, Runtime, RuntimeState, VmOperation,
};
pub use sync::{InflateCause, ObjectSynchronizer, WaitStatus};
pub use thread::{MutatorThread, ThreadId, ThreadState};

/// FVM version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create and start a runtime with default configuration
pub fn init() -> Result<Runtime> {
    Runtime::with_config(VmConfig::default())
}

/// Create and start a runtime with `config`
pub fn init_with_config(config: VmConfig) -> Result<Runtime> {
    Runtime::with_config(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_default() {
        let runtime = init().unwrap();
        assert_eq!(runtime.state(), RuntimeState::Running);
        runtime.stop().unwrap();
        assert_eq!(runtime.state(), RuntimeState::Stopped);
    }

    #[test]
    fn test_version_not_empty() {
        assert!(!VERSION.is_empty());
    }
}
