//! Engine Logging and Tracing
//!
//! Structured events for coordinator, handshake and monitor activity,
//! useful for:
//! - Performance analysis
//! - Debugging
//! - Tests that must observe protocol episodes (e.g. one safepoint
//!   covering several coalesced operations)
//!
//! Each `Runtime` owns its own `VmLogger`; there is no process-wide logger.
//! Diagnostics that are not events go through the `log` facade.
//!
//! Log Levels:
//! - ERROR: timeouts, fatal violations
//! - INFO: safepoints, forced maintenance safepoints
//! - DEBUG: operations, handshakes, deflation passes
//! - TRACE: individual inflations

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Log level for engine events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

/// Engine event types
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VmEvent {
    /// All mutators reached a safe state
    SafepointBegin {
        safepoint_id: u64,
        operation: String,
        threads: usize,
        sync_us: u64,
    },

    /// Safepoint released
    SafepointEnd {
        safepoint_id: u64,
        operations: usize,
        pause_us: u64,
    },

    /// Coordinator synthesized a safepoint for maintenance
    ForcedSafepoint { idle_ms: u64 },

    /// One VM operation finished executing
    OperationExecuted {
        operation: String,
        at_safepoint: bool,
        ticket: u64,
    },

    /// Handshake processed for one thread
    HandshakeExecuted {
        operation: String,
        thread: u64,
        by_self: bool,
    },

    /// Handshake round finished
    HandshakeCompleted {
        operation: String,
        executed: usize,
        skipped: usize,
        duration_us: u64,
    },

    /// Object lock promoted to a heavyweight monitor
    Inflated {
        object: usize,
        monitor: usize,
        cause: String,
    },

    /// Idle monitors reclaimed at a safepoint
    DeflationPass {
        scanned: usize,
        deflated: usize,
        duration_us: u64,
    },

    /// Protocol deadline exceeded
    Timeout {
        protocol: String,
        elapsed_ms: u64,
        pending: usize,
    },
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct VmLoggerConfig {
    /// Minimum log level
    pub level: LogLevel,

    /// Enable console output
    pub console: bool,

    /// Enable JSON format
    pub json: bool,

    /// Enable timestamps
    pub timestamps: bool,

    /// Keep events in memory for inspection
    pub record: bool,
}

impl Default for VmLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Trace,
            console: false,
            json: false,
            timestamps: true,
            record: true,
        }
    }
}

/// VmLogger - event sink for one runtime
pub struct VmLogger {
    config: VmLoggerConfig,
    events: Mutex<Vec<(Instant, VmEvent)>>,
    enabled: AtomicBool,
}

impl VmLogger {
    /// Create new logger
    pub fn new(config: VmLoggerConfig) -> Self {
        Self {
            config,
            events: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
        }
    }

    /// Logger that prints to the console when `verbose` is set
    pub fn for_runtime(verbose: bool) -> Self {
        Self::new(VmLoggerConfig {
            console: verbose,
            ..Default::default()
        })
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Log an event
    pub fn log(&self, event: VmEvent) {
        if !self.is_enabled() {
            return;
        }

        let level = Self::event_level(&event);
        if level > self.config.level {
            return;
        }

        forward_to_facade(level, &event);

        if self.config.console {
            self.output_console(&event);
        }

        if self.config.record {
            self.events.lock().push((Instant::now(), event));
        }
    }

    fn event_level(event: &VmEvent) -> LogLevel {
        match event {
            VmEvent::Timeout { .. } => LogLevel::Error,
            VmEvent::SafepointBegin { .. }
            | VmEvent::SafepointEnd { .. }
            | VmEvent::ForcedSafepoint { .. } => LogLevel::Info,
            VmEvent::OperationExecuted { .. }
            | VmEvent::HandshakeExecuted { .. }
            | VmEvent::HandshakeCompleted { .. }
            | VmEvent::DeflationPass { .. } => LogLevel::Debug,
            VmEvent::Inflated { .. } => LogLevel::Trace,
        }
    }

    fn output_console(&self, event: &VmEvent) {
        let prefix = if self.config.timestamps {
            format!("[{}] ", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        } else {
            String::new()
        };

        if self.config.json {
            if let Ok(json) = serde_json::to_string(event) {
                println!("{}{}", prefix, json);
            }
        } else {
            println!("{}{}", prefix, human(event));
        }
    }

    /// Get all events
    pub fn events(&self) -> Vec<(Instant, VmEvent)> {
        self.events.lock().clone()
    }

    /// Count recorded events matching `pred`
    pub fn count_matching<F>(&self, pred: F) -> usize
    where
        F: Fn(&VmEvent) -> bool,
    {
        self.events.lock().iter().filter(|(_, e)| pred(e)).count()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }
}

impl Default for VmLogger {
    fn default() -> Self {
        Self::new(VmLoggerConfig::default())
    }
}

fn forward_to_facade(level: LogLevel, event: &VmEvent) {
    match level {
        LogLevel::Error => log::error!("{}", human(event)),
        LogLevel::Warn => log::warn!("{}", human(event)),
        LogLevel::Info => log::info!("{}", human(event)),
        LogLevel::Debug => log::debug!("{}", human(event)),
        LogLevel::Trace => log::trace!("{}", human(event)),
    }
}

/// Human-readable rendering
fn human(event: &VmEvent) -> String {
    match event {
        VmEvent::SafepointBegin {
            safepoint_id,
            operation,
            threads,
            sync_us,
        } => format!(
            "[VM] Safepoint {} reached for {} ({} threads, sync {} us)",
            safepoint_id, operation, threads, sync_us
        ),
        VmEvent::SafepointEnd {
            safepoint_id,
            operations,
            pause_us,
        } => format!(
            "[VM] Safepoint {} released ({} operations, pause {} us)",
            safepoint_id, operations, pause_us
        ),
        VmEvent::ForcedSafepoint { idle_ms } => format!(
            "[VM] Forcing maintenance safepoint after {} ms without one",
            idle_ms
        ),
        VmEvent::OperationExecuted {
            operation,
            at_safepoint,
            ticket,
        } => format!(
            "[VM] Executed {} (ticket {}, safepoint: {})",
            operation, ticket, at_safepoint
        ),
        VmEvent::HandshakeExecuted {
            operation,
            thread,
            by_self,
        } => format!(
            "[VM] Handshake {} processed for thread #{} by {}",
            operation,
            thread,
            if *by_self { "target" } else { "coordinator" }
        ),
        VmEvent::HandshakeCompleted {
            operation,
            executed,
            skipped,
            duration_us,
        } => format!(
            "[VM] Handshake {} completed: {} executed, {} skipped ({} us)",
            operation, executed, skipped, duration_us
        ),
        VmEvent::Inflated {
            object,
            monitor,
            cause,
        } => format!(
            "[VM] Inflated {} -> monitor {} ({})",
            crate::util::format_address(*object),
            crate::util::format_address(*monitor),
            cause
        ),
        VmEvent::DeflationPass {
            scanned,
            deflated,
            duration_us,
        } => format!(
            "[VM] Deflation scanned {} monitors, deflated {} ({} us)",
            scanned, deflated, duration_us
        ),
        VmEvent::Timeout {
            protocol,
            elapsed_ms,
            pending,
        } => format!(
            "[VM] {} timed out after {} ms with {} threads pending",
            protocol, elapsed_ms, pending
        ),
    }
}
