//! In-process platform metrics: counters, gauges, and latency histograms,
//! exported as a JSON snapshot on `/api/metrics` and inside `/health`.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::{json, Value};

const HISTOGRAM_KEEP: usize = 1000;

pub struct Metrics {
    started_at: Instant,
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
            histograms: Mutex::new(HashMap::new()),
        }
    }

    pub fn inc(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, amount: u64) {
        *self.counters.lock().entry(name.to_owned()).or_insert(0) += amount;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.gauges.lock().insert(name.to_owned(), value);
    }

    /// Record a latency observation in milliseconds.
    pub fn observe(&self, name: &str, value_ms: f64) {
        let mut histograms = self.histograms.lock();
        let values = histograms.entry(name.to_owned()).or_default();
        values.push(value_ms);
        if values.len() > HISTOGRAM_KEEP {
            let excess = values.len() - HISTOGRAM_KEEP;
            values.drain(..excess);
        }
    }

    pub fn snapshot(&self) -> Value {
        let mut out = json!({
            "uptime_seconds": self.started_at.elapsed().as_secs(),
            "counters": self.counters.lock().clone(),
            "gauges": self.gauges.lock().clone(),
        });
        let histograms = self.histograms.lock();
        for (name, values) in histograms.iter() {
            if values.is_empty() {
                continue;
            }
            let sum: f64 = values.iter().sum();
            let max = values.iter().cloned().fold(f64::MIN, f64::max);
            let min = values.iter().cloned().fold(f64::MAX, f64::min);
            out[format!("histogram_{name}")] = json!({
                "count": values.len(),
                "avg": (sum / values.len() as f64 * 100.0).round() / 100.0,
                "max": (max * 100.0).round() / 100.0,
                "min": (min * 100.0).round() / 100.0,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_gauges() {
        let metrics = Metrics::new();
        metrics.inc("sessions_total");
        metrics.inc("sessions_total");
        metrics.add("events_processed", 5);
        metrics.set_gauge("nodes_registered", 7.0);

        assert_eq!(metrics.counter("sessions_total"), 2);
        assert_eq!(metrics.counter("missing"), 0);

        let snap = metrics.snapshot();
        assert_eq!(snap["counters"]["events_processed"], 5);
        assert_eq!(snap["gauges"]["nodes_registered"], 7.0);
    }

    #[test]
    fn histogram_summary() {
        let metrics = Metrics::new();
        metrics.observe("node_latency:search", 10.0);
        metrics.observe("node_latency:search", 30.0);

        let snap = metrics.snapshot();
        let summary = &snap["histogram_node_latency:search"];
        assert_eq!(summary["count"], 2);
        assert_eq!(summary["avg"], 20.0);
        assert_eq!(summary["max"], 30.0);
    }

    #[test]
    fn histogram_is_bounded() {
        let metrics = Metrics::new();
        for i in 0..(HISTOGRAM_KEEP + 100) {
            metrics.observe("x", i as f64);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap["histogram_x"]["count"], HISTOGRAM_KEEP);
    }
}
