//! In-process counters and gauges for the pipeline.
//!
//! Everything lives behind one lock and only for the lifetime of the
//! process. Gauges hold the last value set; counters only grow until
//! [`MetricsCollector::reset`].

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

#[derive(Debug)]
struct MetricsInner {
    gauges: HashMap<String, f64>,
    counters: HashMap<String, u64>,
    started: Instant,
}

#[derive(Debug)]
pub struct MetricsCollector {
    inner: Mutex<MetricsInner>,
}

/// Gauges and counters merged into one map, plus uptime.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: f64,
    pub values: BTreeMap<String, f64>,
}

impl MetricsSnapshot {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsInner {
                gauges: HashMap::new(),
                counters: HashMap::new(),
                started: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsInner> {
        // Counters stay usable even if a holder panicked mid-update
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, name: &str, value: f64) {
        self.lock().gauges.insert(name.to_string(), value);
    }

    pub fn increment(&self, name: &str, amount: u64) {
        *self.lock().counters.entry(name.to_string()).or_insert(0) += amount;
    }

    /// Set several gauges under a single lock acquisition.
    pub fn update<I, K>(&self, values: I)
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let mut inner = self.lock();
        for (name, value) in values {
            inner.gauges.insert(name.into(), value);
        }
    }

    /// Add `amount` to a gauge, creating it at zero. Used for running totals
    /// that are reported alongside the matching counter.
    pub fn add(&self, name: &str, amount: f64) {
        *self.lock().gauges.entry(name.to_string()).or_insert(0.0) += amount;
    }

    /// Gauge value if set, otherwise counter value, otherwise `default`.
    pub fn get(&self, name: &str, default: f64) -> f64 {
        let inner = self.lock();
        if let Some(value) = inner.gauges.get(name) {
            return *value;
        }
        if let Some(value) = inner.counters.get(name) {
            return *value as f64;
        }
        default
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.lock().counters.get(name).copied().unwrap_or(0)
    }

    pub fn get_all(&self) -> MetricsSnapshot {
        let inner = self.lock();
        let mut values: BTreeMap<String, f64> = inner
            .gauges
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        for (name, value) in &inner.counters {
            values.insert(name.clone(), *value as f64);
        }
        MetricsSnapshot {
            uptime_secs: inner.started.elapsed().as_secs_f64(),
            values,
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.gauges.clear();
        inner.counters.clear();
        inner.started = Instant::now();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
