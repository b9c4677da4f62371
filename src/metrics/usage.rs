//! Per-key usage tracking with rolling latency quantiles.
//!
//! Separate from the Prometheus-style registry: each key holds a bounded
//! ring of recent latency samples plus request and error counters, and
//! quantiles are recomputed on demand by copy + sort. When the ring fills,
//! the oldest quarter is discarded at once, which keeps the copy cost
//! amortised constant per record.
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::Serialize;

/// Ring capacity per key.
const MAX_SAMPLES: usize = 1000;

/// Bounded latency sample window, in seconds.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: Vec<f64>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, duration: Duration) {
        if self.samples.len() >= self.capacity {
            self.samples.drain(..self.capacity / 4);
        }
        self.samples.push(duration.as_secs_f64());
    }

    /// Quantile over the current window by sorted-index selection on
    /// `floor((n - 1) * p)`. Zero when empty.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let idx = ((sorted.len() - 1) as f64 * p) as usize;
        sorted[idx]
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug)]
struct UsageEntry {
    requests: AtomicU64,
    errors: AtomicU64,
    latencies: Mutex<LatencyWindow>,
}

impl UsageEntry {
    fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latencies: Mutex::new(LatencyWindow::new(MAX_SAMPLES)),
        }
    }
}

/// One `/stats` row.
#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub key: String,
    pub request_count: u64,
    pub error_count: u64,
    pub p50_latency_ms: f64,
    pub p90_latency_ms: f64,
    pub p99_latency_ms: f64,
}

/// Per-key request/error counters and latency windows.
pub struct UsageTracker {
    entries: RwLock<HashMap<String, Arc<UsageEntry>>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, key: &str) -> Arc<UsageEntry> {
        if let Some(entry) = self.entries.read().unwrap_or_else(|e| e.into_inner()).get(key) {
            return entry.clone();
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(UsageEntry::new()))
            .clone()
    }

    /// Record one request outcome for `key`.
    pub fn record(&self, key: &str, duration: Duration, is_error: bool) {
        let entry = self.entry(key);
        entry.requests.fetch_add(1, Ordering::Relaxed);
        if is_error {
            entry.errors.fetch_add(1, Ordering::Relaxed);
        }
        let mut window = entry.latencies.lock().unwrap_or_else(|e| e.into_inner());
        window.record(duration);
    }

    /// Snapshot every key's counters and quantiles (milliseconds).
    pub fn stats(&self) -> Vec<UsageStats> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .map(|(key, entry)| {
                let window = entry.latencies.lock().unwrap_or_else(|e| e.into_inner());
                UsageStats {
                    key: key.clone(),
                    request_count: entry.requests.load(Ordering::Relaxed),
                    error_count: entry.errors.load(Ordering::Relaxed),
                    p50_latency_ms: window.percentile(0.50) * 1000.0,
                    p90_latency_ms: window.percentile(0.90) * 1000.0,
                    p99_latency_ms: window.percentile(0.99) * 1000.0,
                }
            })
            .collect()
    }
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new()
    }
}
