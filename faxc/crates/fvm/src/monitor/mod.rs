//! Monitor Module - Heavyweight Locks and Their Registry
//!
//! - `ObjectMonitor`: owner, recursion, entry queue and wait set
//! - `list`: tagged-pointer lists linking monitors without a global lock
//! - `MonitorRegistry`: global and per-thread free/in-use pools, block carving
//! - `audit`: structural verification used by tests and `verify_monitors`

pub mod audit;
pub mod list;
pub mod object_monitor;
pub mod registry;

pub use audit::{AuditReport, ListAudit};
pub use list::MonitorList;
pub use object_monitor::{ObjectMonitor, WaitStatus};
pub use registry::{DeflationReport, MonitorRegistry, ThreadMonitorCache};
