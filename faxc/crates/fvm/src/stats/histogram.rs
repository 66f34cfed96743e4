//! Histogram - Pause Time Histogram
//!
//! Tracks the distribution of safepoint pause and time-to-safepoint
//! durations. Percentiles (P50, P95, P99) come out as bucket exponents.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Histogram - logarithmic bucket histogram
pub struct Histogram {
    /// Bucket counts (bucket = bit length of the value)
    buckets: Mutex<BTreeMap<u64, u64>>,

    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Create new histogram
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(BTreeMap::new()),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Record value
    pub fn record(&self, value: u64) {
        let bucket = Self::bucket_of(value);
        *self.buckets.lock().entry(bucket).or_insert(0) += 1;

        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.min.fetch_min(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    fn bucket_of(value: u64) -> u64 {
        if value == 0 {
            0
        } else {
            // Logarithmic buckets: 1, 2, 4, 8, 16, ...
            64 - value.leading_zeros() as u64
        }
    }

    /// Upper bound of the bucket holding the `p` quantile
    pub fn percentile(&self, p: f64) -> u64 {
        let buckets = self.buckets.lock();
        let total = self.count.load(Ordering::Relaxed);

        if total == 0 {
            return 0;
        }

        let target = ((total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0;

        for (&bucket, &count) in buckets.iter() {
            cumulative += count;
            if cumulative >= target {
                return bucket_upper_bound(bucket);
            }
        }

        buckets
            .last_key_value()
            .map(|(&k, _)| bucket_upper_bound(k))
            .unwrap_or(0)
    }

    pub fn p50(&self) -> u64 {
        self.percentile(0.50)
    }

    pub fn p99(&self) -> u64 {
        self.percentile(0.99)
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    pub fn min(&self) -> u64 {
        match self.min.load(Ordering::Relaxed) {
            u64::MAX => 0,
            v => v,
        }
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum.load(Ordering::Relaxed) as f64 / count as f64
        }
    }
}

fn bucket_upper_bound(bucket: u64) -> u64 {
    if bucket == 0 {
        0
    } else {
        (1u64 << bucket.min(63)) - 1
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}
