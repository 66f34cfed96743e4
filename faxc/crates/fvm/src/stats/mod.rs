//! Stats Module - Engine Performance Monitoring
//!
//! Collects counters for the coordinator, handshakes and the monitor
//! subsystem, plus pause-time distributions:
//! - Safepoint pause time and time-to-safepoint (µs)
//! - Coalesced operations per safepoint
//! - Inflations by cause, deflations
//! - Handshakes processed by the target itself vs. the coordinator

pub mod histogram;
pub mod metrics;
pub mod timer;

pub use histogram::Histogram;
pub use metrics::{MetricValue, VmMetrics};
pub use timer::VmTimer;

use crate::sync::InflateCause;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// VmStats - statistics collector for the engine
pub struct VmStats {
    enabled: bool,

    safepoints: AtomicU64,
    forced_safepoints: AtomicU64,
    operations: AtomicU64,
    coalesced_operations: AtomicU64,

    handshakes_by_self: AtomicU64,
    handshakes_by_coordinator: AtomicU64,
    handshakes_skipped: AtomicU64,

    inflations: [AtomicU64; InflateCause::COUNT],
    deflations: AtomicU64,
    deflation_passes: AtomicU64,

    pause_times: Histogram,
    sync_times: Histogram,
}

impl VmStats {
    /// Create new stats collector
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            safepoints: AtomicU64::new(0),
            forced_safepoints: AtomicU64::new(0),
            operations: AtomicU64::new(0),
            coalesced_operations: AtomicU64::new(0),
            handshakes_by_self: AtomicU64::new(0),
            handshakes_by_coordinator: AtomicU64::new(0),
            handshakes_skipped: AtomicU64::new(0),
            inflations: Default::default(),
            deflations: AtomicU64::new(0),
            deflation_passes: AtomicU64::new(0),
            pause_times: Histogram::new(),
            sync_times: Histogram::new(),
        }
    }

    /// Record a completed safepoint episode
    pub fn record_safepoint(&self, time_to_safepoint: Duration, pause: Duration, coalesced: usize) {
        self.safepoints.fetch_add(1, Ordering::Relaxed);
        self.coalesced_operations
            .fetch_add(coalesced as u64, Ordering::Relaxed);
        if self.enabled {
            self.sync_times.record(time_to_safepoint.as_micros() as u64);
            self.pause_times.record(pause.as_micros() as u64);
        }
    }

    pub fn record_forced_safepoint(&self) {
        self.forced_safepoints.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_operation(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake(&self, by_self: bool) {
        let counter = if by_self {
            &self.handshakes_by_self
        } else {
            &self.handshakes_by_coordinator
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_skipped(&self) {
        self.handshakes_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inflation(&self, cause: InflateCause) {
        self.inflations[cause as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deflation_pass(&self, deflated: usize) {
        self.deflation_passes.fetch_add(1, Ordering::Relaxed);
        self.deflations.fetch_add(deflated as u64, Ordering::Relaxed);
    }

    pub fn safepoints(&self) -> u64 {
        self.safepoints.load(Ordering::Relaxed)
    }

    pub fn forced_safepoints(&self) -> u64 {
        self.forced_safepoints.load(Ordering::Relaxed)
    }

    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    pub fn coalesced_operations(&self) -> u64 {
        self.coalesced_operations.load(Ordering::Relaxed)
    }

    pub fn handshakes_by_self(&self) -> u64 {
        self.handshakes_by_self.load(Ordering::Relaxed)
    }

    pub fn handshakes_by_coordinator(&self) -> u64 {
        self.handshakes_by_coordinator.load(Ordering::Relaxed)
    }

    pub fn handshakes_skipped(&self) -> u64 {
        self.handshakes_skipped.load(Ordering::Relaxed)
    }

    pub fn inflations(&self, cause: InflateCause) -> u64 {
        self.inflations[cause as usize].load(Ordering::Relaxed)
    }

    pub fn total_inflations(&self) -> u64 {
        self.inflations
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    pub fn deflations(&self) -> u64 {
        self.deflations.load(Ordering::Relaxed)
    }

    pub fn deflation_passes(&self) -> u64 {
        self.deflation_passes.load(Ordering::Relaxed)
    }

    pub fn pause_times(&self) -> &Histogram {
        &self.pause_times
    }

    pub fn sync_times(&self) -> &Histogram {
        &self.sync_times
    }

    /// Snapshot as exportable metrics
    pub fn metrics(&self) -> VmMetrics {
        let mut m = VmMetrics::new();
        m.add("safepoints_total", MetricValue::Counter(self.safepoints()));
        m.add(
            "forced_safepoints_total",
            MetricValue::Counter(self.forced_safepoints()),
        );
        m.add("operations_total", MetricValue::Counter(self.operations()));
        m.add(
            "coalesced_operations_total",
            MetricValue::Counter(self.coalesced_operations()),
        );
        m.add(
            "handshakes_self_total",
            MetricValue::Counter(self.handshakes_by_self()),
        );
        m.add(
            "handshakes_coordinator_total",
            MetricValue::Counter(self.handshakes_by_coordinator()),
        );
        m.add(
            "handshakes_skipped_total",
            MetricValue::Counter(self.handshakes_skipped()),
        );
        m.add(
            "inflations_total",
            MetricValue::Counter(self.total_inflations()),
        );
        m.add("deflations_total", MetricValue::Counter(self.deflations()));
        m.add(
            "safepoint_pause_us_mean",
            MetricValue::Gauge(self.pause_times.mean()),
        );
        m.add(
            "safepoint_pause_us_p99",
            MetricValue::Gauge(self.pause_times.p99() as f64),
        );
        m.add(
            "time_to_safepoint_us_mean",
            MetricValue::Gauge(self.sync_times.mean()),
        );
        m
    }
}

impl Default for VmStats {
    fn default() -> Self {
        Self::new(true)
    }
}
