//! VM Metrics - Export Metrics
//!
//! Flattens `VmStats` into name/value pairs for monitoring systems.

use indexmap::IndexMap;

/// Metric value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(f64),
}

impl MetricValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            MetricValue::Counter(v) => *v as f64,
            MetricValue::Gauge(v) => *v,
        }
    }
}

/// VmMetrics - ordered snapshot of engine metrics
#[derive(Debug, Clone, Default)]
pub struct VmMetrics {
    metrics: IndexMap<&'static str, MetricValue>,
}

impl VmMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add metric
    pub fn add(&mut self, name: &'static str, value: MetricValue) {
        self.metrics.insert(name, value);
    }

    /// Get metric
    pub fn get(&self, name: &str) -> Option<MetricValue> {
        self.metrics.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Export to Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        for (name, value) in self.metrics.iter() {
            output.push_str(&format!("fvm_{} {}\n", name, value.as_f64()));
        }
        output
    }

    /// Export to JSON
    pub fn to_json(&self) -> String {
        let map: serde_json::Map<String, serde_json::Value> = self
            .metrics
            .iter()
            .map(|(name, value)| (name.to_string(), serde_json::json!(value.as_f64())))
            .collect();
        serde_json::Value::Object(map).to_string()
    }
}
