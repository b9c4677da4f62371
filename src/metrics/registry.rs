//! Concurrent counter / gauge / histogram registry with Prometheus text and
//! JSON exposition.
//!
//! Every family is a map from a label string to an atomic primitive. Lookup
//! takes the family read lock; a miss upgrades to the write lock and
//! re-checks before creating, so concurrent observers for the same label set
//! never create duplicate structures. Observation itself is atomic-only.
use std::{
    collections::HashMap,
    fmt::Write as _,
    sync::{
        Arc, RwLock,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

/// Default latency bucket upper bounds in seconds.
pub const DEFAULT_LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Fixed-bound histogram with an overflow bucket. The running sum is kept as
/// integer microseconds so observation stays a pair of atomic adds.
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new(bounds: &[f64]) -> Self {
        let counts = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds: bounds.to_vec(),
            counts,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record one observation in seconds.
    pub fn observe(&self, value: f64) {
        let idx = self.bounds.partition_point(|bound| *bound < value);
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value * 1e6) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of all observations, in seconds.
    pub fn sum_seconds(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1e6
    }

    /// Cumulative counts aligned with `bounds()`, ending with the `+Inf`
    /// bucket. The `k`-th entry equals the sum of the first `k+1` raw
    /// counters.
    pub fn cumulative_counts(&self) -> Vec<u64> {
        let mut cumulative = 0;
        self.counts
            .iter()
            .map(|c| {
                cumulative += c.load(Ordering::Relaxed);
                cumulative
            })
            .collect()
    }

    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }
}

type CounterFamily = RwLock<HashMap<String, Arc<AtomicU64>>>;
type GaugeFamily = RwLock<HashMap<String, Arc<AtomicI64>>>;
type HistogramFamily = RwLock<HashMap<String, Arc<Histogram>>>;

/// The gateway's metric families.
pub struct Metrics {
    requests_total: CounterFamily,
    errors_total: CounterFamily,
    rate_limit_hits: CounterFamily,
    api_key_requests: CounterFamily,
    upstream_health: GaugeFamily,
    requests_in_flight: GaugeFamily,
    request_duration: HistogramFamily,
    upstream_duration: HistogramFamily,
    buckets: Vec<f64>,
}

impl Metrics {
    /// Create a registry; an empty bucket list selects the default ladder.
    pub fn new(latency_buckets: Vec<f64>) -> Self {
        let buckets = if latency_buckets.is_empty() {
            DEFAULT_LATENCY_BUCKETS.to_vec()
        } else {
            latency_buckets
        };

        Self {
            requests_total: RwLock::new(HashMap::new()),
            errors_total: RwLock::new(HashMap::new()),
            rate_limit_hits: RwLock::new(HashMap::new()),
            api_key_requests: RwLock::new(HashMap::new()),
            upstream_health: RwLock::new(HashMap::new()),
            requests_in_flight: RwLock::new(HashMap::new()),
            request_duration: RwLock::new(HashMap::new()),
            upstream_duration: RwLock::new(HashMap::new()),
            buckets,
        }
    }

    fn counter(family: &CounterFamily, key: &str) -> Arc<AtomicU64> {
        if let Some(counter) = family.read().unwrap_or_else(|e| e.into_inner()).get(key) {
            return counter.clone();
        }
        let mut family = family.write().unwrap_or_else(|e| e.into_inner());
        family
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    fn gauge(family: &GaugeFamily, key: &str) -> Arc<AtomicI64> {
        if let Some(gauge) = family.read().unwrap_or_else(|e| e.into_inner()).get(key) {
            return gauge.clone();
        }
        let mut family = family.write().unwrap_or_else(|e| e.into_inner());
        family
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone()
    }

    fn histogram(&self, family: &HistogramFamily, key: &str) -> Arc<Histogram> {
        if let Some(hist) = family.read().unwrap_or_else(|e| e.into_inner()).get(key) {
            return hist.clone();
        }
        let mut family = family.write().unwrap_or_else(|e| e.into_inner());
        family
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Histogram::new(&self.buckets)))
            .clone()
    }

    /// Count a completed request and observe its duration.
    pub fn record_request(&self, route: &str, method: &str, status: u16, duration: Duration) {
        let key = format!("{route}_{method}_{status}");
        Self::counter(&self.requests_total, &key).fetch_add(1, Ordering::Relaxed);

        let hist_key = format!("{route}_{method}");
        self.histogram(&self.request_duration, &hist_key)
            .observe(duration.as_secs_f64());
    }

    /// Count an error outcome (`not_found`, `upstream_not_found`,
    /// `no_healthy_upstream`, `proxy_error`).
    pub fn record_error(&self, route: &str, error_kind: &str) {
        let key = format!("{route}_{error_kind}");
        Self::counter(&self.errors_total, &key).fetch_add(1, Ordering::Relaxed);
    }

    /// Count a rate-limit rejection by tier (`route`, `apikey`, `ip`).
    pub fn record_rate_limit_hit(&self, route: &str, tier: &str) {
        let key = format!("{route}_{tier}");
        Self::counter(&self.rate_limit_hits, &key).fetch_add(1, Ordering::Relaxed);
    }

    /// Count a request attributed to a recognised API client.
    pub fn record_api_key_request(&self, key_name: &str, status: u16) {
        let key = format!("{key_name}_{status}");
        Self::counter(&self.api_key_requests, &key).fetch_add(1, Ordering::Relaxed);
    }

    /// Store the 0/1 health gauge for `(upstream, target)`.
    pub fn record_upstream_health(&self, upstream: &str, target: &str, healthy: bool) {
        let key = format!("{upstream}_{target}");
        Self::gauge(&self.upstream_health, &key).store(i64::from(healthy), Ordering::Relaxed);
    }

    /// Observe the duration of one upstream call.
    pub fn record_upstream_duration(&self, upstream: &str, duration: Duration) {
        self.histogram(&self.upstream_duration, upstream)
            .observe(duration.as_secs_f64());
    }

    /// Increment the in-flight gauge for a route; the returned guard
    /// decrements on drop so every exit path balances the gauge.
    pub fn in_flight(&self, route: &str) -> InFlightGuard {
        let gauge = Self::gauge(&self.requests_in_flight, route);
        gauge.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { gauge }
    }

    /// Render every family in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        Self::write_counter_family(
            &mut out,
            "gateway_requests_total",
            "Total number of requests processed",
            &self.requests_total,
        );
        Self::write_counter_family(
            &mut out,
            "gateway_errors_total",
            "Total number of errors",
            &self.errors_total,
        );
        Self::write_counter_family(
            &mut out,
            "gateway_rate_limit_hits_total",
            "Total number of rate limit hits",
            &self.rate_limit_hits,
        );
        Self::write_counter_family(
            &mut out,
            "gateway_api_key_requests_total",
            "Total requests per API key",
            &self.api_key_requests,
        );
        Self::write_gauge_family(
            &mut out,
            "gateway_upstream_healthy",
            "Whether upstream is healthy",
            &self.upstream_health,
        );
        Self::write_gauge_family(
            &mut out,
            "gateway_requests_in_flight",
            "Number of requests in flight",
            &self.requests_in_flight,
        );
        Self::write_histogram_family(
            &mut out,
            "gateway_request_duration_seconds",
            "Request duration in seconds",
            &self.request_duration,
        );
        Self::write_histogram_family(
            &mut out,
            "gateway_upstream_duration_seconds",
            "Upstream call duration in seconds",
            &self.upstream_duration,
        );

        out
    }

    fn write_counter_family(out: &mut String, name: &str, help: &str, family: &CounterFamily) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} counter");
        let family = family.read().unwrap_or_else(|e| e.into_inner());
        for (key, counter) in family.iter() {
            let _ = writeln!(
                out,
                "{name}{{key=\"{key}\"}} {}",
                counter.load(Ordering::Relaxed)
            );
        }
    }

    fn write_gauge_family(out: &mut String, name: &str, help: &str, family: &GaugeFamily) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} gauge");
        let family = family.read().unwrap_or_else(|e| e.into_inner());
        for (key, gauge) in family.iter() {
            let _ = writeln!(
                out,
                "{name}{{key=\"{key}\"}} {}",
                gauge.load(Ordering::Relaxed)
            );
        }
    }

    fn write_histogram_family(out: &mut String, name: &str, help: &str, family: &HistogramFamily) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        let family = family.read().unwrap_or_else(|e| e.into_inner());
        for (key, hist) in family.iter() {
            let cumulative = hist.cumulative_counts();
            for (bound, count) in hist.bounds().iter().zip(&cumulative) {
                let _ = writeln!(out, "{name}_bucket{{key=\"{key}\",le=\"{bound}\"}} {count}");
            }
            let total = cumulative.last().copied().unwrap_or(0);
            let _ = writeln!(out, "{name}_bucket{{key=\"{key}\",le=\"+Inf\"}} {total}");
            let _ = writeln!(out, "{name}_sum{{key=\"{key}\"}} {}", hist.sum_seconds());
            let _ = writeln!(out, "{name}_count{{key=\"{key}\"}} {}", hist.count());
        }
    }

    /// Snapshot of the counter and gauge families as JSON. Histograms are
    /// served only through the text exposition.
    pub fn json_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "requests_total": Self::counter_map(&self.requests_total),
            "errors_total": Self::counter_map(&self.errors_total),
            "rate_limit_hits": Self::counter_map(&self.rate_limit_hits),
            "api_key_requests": Self::counter_map(&self.api_key_requests),
            "upstream_health": Self::gauge_map(&self.upstream_health),
            "requests_in_flight": Self::gauge_map(&self.requests_in_flight),
        })
    }

    fn counter_map(family: &CounterFamily) -> HashMap<String, u64> {
        let family = family.read().unwrap_or_else(|e| e.into_inner());
        family
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }

    fn gauge_map(family: &GaugeFamily) -> HashMap<String, i64> {
        let family = family.read().unwrap_or_else(|e| e.into_inner());
        family
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }

    /// Current in-flight gauge value for a route (diagnostics / tests).
    pub fn in_flight_count(&self, route: &str) -> i64 {
        Self::gauge(&self.requests_in_flight, route).load(Ordering::Relaxed)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// RAII decrement for the in-flight gauge.
pub struct InFlightGuard {
    gauge: Arc<AtomicI64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::Relaxed);
    }
}
