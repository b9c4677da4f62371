//! Keyed token-bucket admission control.
//!
//! A shared registry maps arbitrary string keys (`route:...`, `apikey:...`,
//! `ip:...`) to token buckets. Lookups take the registry read lock; a miss
//! upgrades to the write lock and re-checks before installing, so two
//! concurrent queries for the same absent key observe exactly one bucket.
//! Refill is lazy and happens under the bucket's own mutex; distinct keys
//! never contend beyond the registry read lock.
//!
//! A background sweeper evicts buckets idle for longer than
//! [`IDLE_EVICTION_THRESHOLD`] and stops cleanly on the shutdown signal.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use tokio::task::JoinHandle;

use crate::utils::graceful_shutdown::ShutdownToken;

/// Buckets idle longer than this are removed by the sweeper.
pub const IDLE_EVICTION_THRESHOLD: Duration = Duration::from_secs(600);

/// A token bucket: capacity `burst`, refilling at `rps` tokens per second.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rps: u32, burst: u32) -> Self {
        Self {
            tokens: f64::from(burst),
            capacity: f64::from(burst),
            refill_rate: f64::from(rps),
            last_refill: Instant::now(),
        }
    }

    /// Refill from elapsed time, then consume one token if available.
    pub fn allow(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Current token level (diagnostics only).
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    fn idle_since(&self, now: Instant) -> Duration {
        now.duration_since(self.last_refill)
    }
}

/// Registry of token buckets keyed by string, with per-key overrides.
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
    default_rps: u32,
    default_burst: u32,
}

impl RateLimiter {
    pub fn new(default_rps: u32, default_burst: u32) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            default_rps,
            default_burst,
        }
    }

    /// Admit one request for `key` under the default limits.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_with_limits(key, self.default_rps, self.default_burst)
    }

    /// Admit one request for `key`, creating the bucket with the given
    /// limits if it does not exist yet. Existing buckets keep their limits.
    pub fn allow_with_limits(&self, key: &str, rps: u32, burst: u32) -> bool {
        let existing = {
            let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
            buckets.get(key).cloned()
        };

        let bucket = match existing {
            Some(bucket) => bucket,
            None => {
                let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
                // Re-check: another task may have installed the bucket while
                // we waited for the write lock.
                buckets
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(rps, burst))))
                    .clone()
            }
        };

        let mut bucket = bucket.lock().unwrap_or_else(|e| e.into_inner());
        bucket.allow()
    }

    /// Replace the bucket for `key` with a fresh, fully-filled one at the
    /// given limits. Used to pre-seed recognised API clients.
    pub fn set_limits(&self, key: &str, rps: u32, burst: u32) {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        buckets.insert(
            key.to_string(),
            Arc::new(Mutex::new(TokenBucket::new(rps, burst))),
        );
    }

    /// Current token level per key.
    pub fn stats(&self) -> HashMap<String, f64> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        buckets
            .iter()
            .map(|(key, bucket)| {
                let bucket = bucket.lock().unwrap_or_else(|e| e.into_inner());
                (key.clone(), bucket.tokens())
            })
            .collect()
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        buckets.len()
    }

    /// Remove every bucket whose last refill is older than the idle
    /// threshold. Runs under the registry write lock so the sweep is atomic
    /// with respect to admissions.
    pub fn evict_idle(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        buckets.retain(|_, bucket| {
            let bucket = bucket.lock().unwrap_or_else(|e| e.into_inner());
            bucket.idle_since(now) <= IDLE_EVICTION_THRESHOLD
        });
    }

    /// Spawn the periodic eviction sweeper. The task wakes every `interval`,
    /// sweeps, and exits when the shutdown token fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: ShutdownToken,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately; skip it
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        limiter.evict_idle();
                        tracing::debug!(buckets = limiter.bucket_count(), "rate limiter sweep completed");
                    }
                    _ = shutdown.wait() => {
                        tracing::debug!("rate limiter sweeper stopping");
                        break;
                    }
                }
            }
        })
    }
}
