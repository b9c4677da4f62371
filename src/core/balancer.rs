//! Liveness-aware load balancing over a fixed target set.
//!
//! The four disciplines are modelled as a tagged enum rather than trait
//! objects: the hot path stays branch-predictable and `next()` never
//! allocates beyond the `Arc` clone of the chosen target. Selection relies on
//! per-target atomics; only the smooth weighted rotation keeps its cursor
//! state under a mutex.
//!
//! `next()` falls back to the first target when no target is live so that
//! recovery probes keep a destination; the proxy layer re-checks the returned
//! target's liveness and maps a dead selection to 503.
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
};

use http::Uri;
use rand::Rng;

use crate::config::models::BalanceDiscipline;

/// One upstream target with its runtime state.
#[derive(Debug)]
pub struct Target {
    url: Uri,
    weight: u32,
    live: AtomicBool,
    in_flight: AtomicI64,
}

impl Target {
    /// Build a target from an absolute URI. Non-positive weights are coerced
    /// to 1 at this boundary; the balancer itself never adjusts weights.
    pub fn new(url: Uri, weight: i64) -> Self {
        Self {
            url,
            weight: if weight <= 0 { 1 } else { weight as u32 },
            live: AtomicBool::new(true),
            in_flight: AtomicI64::new(0),
        }
    }

    /// Build a target keeping the weight exactly as given (zero allowed).
    /// Used where the caller owns the coercion policy.
    pub fn with_exact_weight(url: Uri, weight: u32) -> Self {
        Self {
            url,
            weight,
            live: AtomicBool::new(true),
            in_flight: AtomicI64::new(0),
        }
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Stable label for metrics and logs: `scheme://authority`.
    pub fn label(&self) -> String {
        format!(
            "{}://{}",
            self.url.scheme_str().unwrap_or("http"),
            self.url
                .authority()
                .map_or_else(|| "unknown".to_string(), |a| a.to_string())
        )
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Release);
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

/// RAII in-flight counter: increments on construction, decrements on drop so
/// every exit path of the proxy pipeline balances the counter exactly once.
pub struct ConnectionGuard {
    target: Arc<Target>,
}

impl ConnectionGuard {
    pub fn new(target: Arc<Target>) -> Self {
        target.in_flight.fetch_add(1, Ordering::Relaxed);
        Self { target }
    }

    pub fn target(&self) -> &Arc<Target> {
        &self.target
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.target.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Tagged dispatch over the four selection disciplines.
pub enum LoadBalancer {
    RoundRobin(RoundRobin),
    LeastConn(LeastConn),
    Random(Random),
    WeightedRoundRobin(WeightedRoundRobin),
}

impl LoadBalancer {
    /// Factory mapping the configured discipline to its variant.
    pub fn new(discipline: BalanceDiscipline, targets: Vec<Arc<Target>>) -> Self {
        match discipline {
            BalanceDiscipline::RoundRobin => Self::RoundRobin(RoundRobin::new(targets)),
            BalanceDiscipline::LeastConn => Self::LeastConn(LeastConn::new(targets)),
            BalanceDiscipline::Random => Self::Random(Random::new(targets)),
            BalanceDiscipline::WeightedRoundRobin => {
                Self::WeightedRoundRobin(WeightedRoundRobin::new(targets))
            }
        }
    }

    /// Select a target. `None` only when the target set is empty.
    pub fn next(&self) -> Option<Arc<Target>> {
        match self {
            Self::RoundRobin(lb) => lb.next(),
            Self::LeastConn(lb) => lb.next(),
            Self::Random(lb) => lb.next(),
            Self::WeightedRoundRobin(lb) => lb.next(),
        }
    }

    /// Read-only snapshot of the target set.
    pub fn targets(&self) -> &[Arc<Target>] {
        match self {
            Self::RoundRobin(lb) => &lb.targets,
            Self::LeastConn(lb) => &lb.targets,
            Self::Random(lb) => &lb.targets,
            Self::WeightedRoundRobin(lb) => &lb.targets,
        }
    }

    /// Flip a target's liveness flag.
    pub fn mark_live(&self, target: &Target, live: bool) {
        target.set_live(live);
    }
}

/// Atomic cursor modulo the target count; skips up to `N` dead positions.
pub struct RoundRobin {
    targets: Vec<Arc<Target>>,
    cursor: AtomicU64,
}

impl RoundRobin {
    pub fn new(targets: Vec<Arc<Target>>) -> Self {
        Self {
            targets,
            cursor: AtomicU64::new(0),
        }
    }

    fn next(&self) -> Option<Arc<Target>> {
        if self.targets.is_empty() {
            return None;
        }

        let n = self.targets.len();
        for _ in 0..n {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % n;
            let target = &self.targets[idx];
            if target.is_live() {
                return Some(target.clone());
            }
        }

        Some(self.targets[0].clone())
    }
}

/// Linear scan for the live target with the fewest in-flight requests.
/// Counter loads may drift relative to one another; that approximation is
/// acceptable.
pub struct LeastConn {
    targets: Vec<Arc<Target>>,
}

impl LeastConn {
    pub fn new(targets: Vec<Arc<Target>>) -> Self {
        Self { targets }
    }

    fn next(&self) -> Option<Arc<Target>> {
        if self.targets.is_empty() {
            return None;
        }

        let mut best: Option<&Arc<Target>> = None;
        let mut min_conn = i64::MAX;
        for target in &self.targets {
            if !target.is_live() {
                continue;
            }
            let conn = target.in_flight();
            if best.is_none() || conn < min_conn {
                min_conn = conn;
                best = Some(target);
            }
        }

        Some(best.unwrap_or(&self.targets[0]).clone())
    }
}

/// Uniform pick over the live sublist (over all targets when none is live).
pub struct Random {
    targets: Vec<Arc<Target>>,
}

impl Random {
    pub fn new(targets: Vec<Arc<Target>>) -> Self {
        Self { targets }
    }

    fn next(&self) -> Option<Arc<Target>> {
        if self.targets.is_empty() {
            return None;
        }

        let live: Vec<&Arc<Target>> = self.targets.iter().filter(|t| t.is_live()).collect();
        let mut rng = rand::rng();
        if live.is_empty() {
            let idx = rng.random_range(0..self.targets.len());
            return Some(self.targets[idx].clone());
        }

        Some(live[rng.random_range(0..live.len())].clone())
    }
}

struct WrrCursor {
    current: i64,
    current_weight: i64,
}

/// Nginx-style smooth weighted round-robin: over `sum(weights)` selections
/// target `i` is chosen `weights[i]` times, interleaved rather than clumped.
pub struct WeightedRoundRobin {
    targets: Vec<Arc<Target>>,
    weights: Vec<u32>,
    max_weight: u32,
    gcd: u32,
    cursor: Mutex<WrrCursor>,
}

impl WeightedRoundRobin {
    pub fn new(targets: Vec<Arc<Target>>) -> Self {
        let weights: Vec<u32> = targets.iter().map(|t| t.weight()).collect();
        let max_weight = weights.iter().copied().max().unwrap_or(0);
        let gcd = weights.iter().copied().fold(0, gcd);

        Self {
            targets,
            weights,
            max_weight,
            gcd: gcd.max(1),
            cursor: Mutex::new(WrrCursor {
                current: -1,
                current_weight: 0,
            }),
        }
    }

    fn next(&self) -> Option<Arc<Target>> {
        if self.targets.is_empty() {
            return None;
        }

        let n = self.targets.len() as i64;
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());

        loop {
            cursor.current = (cursor.current + 1) % n;
            if cursor.current == 0 {
                cursor.current_weight -= self.gcd as i64;
                if cursor.current_weight <= 0 {
                    cursor.current_weight = self.max_weight as i64;
                }
            }

            let idx = cursor.current as usize;
            if self.weights[idx] as i64 >= cursor.current_weight {
                let target = &self.targets[idx];
                if target.is_live() {
                    return Some(target.clone());
                }
            }

            // A full rotation found nothing live; hand back the first target
            // and let the caller's liveness check decide.
            if cursor.current == 0 && cursor.current_weight == self.max_weight as i64 {
                return Some(self.targets[0].clone());
            }
        }
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    let (mut a, mut b) = (a, b);
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn make_targets(urls: &[&str]) -> Vec<Arc<Target>> {
        urls.iter()
            .map(|u| Arc::new(Target::new(u.parse().unwrap(), 1)))
            .collect()
    }

    fn tally(lb: &LoadBalancer, picks: usize) -> HashMap<String, usize> {
        let mut seen = HashMap::new();
        for _ in 0..picks {
            let target = lb.next().expect("should select a target");
            *seen.entry(target.label()).or_default() += 1;
        }
        seen
    }

    #[test]
    fn round_robin_rotates_evenly() {
        let lb = LoadBalancer::new(
            BalanceDiscipline::RoundRobin,
            make_targets(&["http://a:8080", "http://b:8080", "http://c:8080"]),
        );

        let seen = tally(&lb, 9);
        for (host, count) in &seen {
            assert_eq!(*count, 3, "{host} selected {count} times");
        }
    }

    #[test]
    fn round_robin_skips_dead_targets() {
        let targets = make_targets(&["http://a:8080", "http://b:8080", "http://c:8080"]);
        let lb = LoadBalancer::new(BalanceDiscipline::RoundRobin, targets.clone());

        lb.mark_live(&targets[1], false);

        let seen = tally(&lb, 6);
        assert_eq!(seen.get("http://b:8080"), None);
        assert_eq!(seen["http://a:8080"], 3);
        assert_eq!(seen["http://c:8080"], 3);
    }

    #[test]
    fn round_robin_falls_back_to_first_when_all_dead() {
        let targets = make_targets(&["http://a:8080", "http://b:8080"]);
        let lb = LoadBalancer::new(BalanceDiscipline::RoundRobin, targets.clone());

        for t in &targets {
            lb.mark_live(t, false);
        }

        let picked = lb.next().unwrap();
        assert_eq!(picked.label(), "http://a:8080");
        assert!(!picked.is_live());
    }

    #[test]
    fn least_conn_prefers_fewest_in_flight() {
        let targets = make_targets(&["http://a:8080", "http://b:8080"]);
        let lb = LoadBalancer::new(BalanceDiscipline::LeastConn, targets.clone());

        let _a1 = ConnectionGuard::new(targets[0].clone());
        let _a2 = ConnectionGuard::new(targets[0].clone());
        let _b1 = ConnectionGuard::new(targets[1].clone());

        let picked = lb.next().unwrap();
        assert_eq!(picked.label(), "http://b:8080");
    }

    #[test]
    fn least_conn_never_picks_a_strictly_busier_live_target() {
        let targets = make_targets(&["http://a:8080", "http://b:8080", "http://c:8080"]);
        let lb = LoadBalancer::new(BalanceDiscipline::LeastConn, targets.clone());

        let _guards: Vec<_> = [0, 0, 0, 1, 1, 2]
            .iter()
            .map(|&i| ConnectionGuard::new(targets[i].clone()))
            .collect();

        let picked = lb.next().unwrap();
        let picked_conns = picked.in_flight();
        for t in lb.targets() {
            if t.is_live() {
                assert!(picked_conns <= t.in_flight());
            }
        }
    }

    #[test]
    fn least_conn_ties_break_first_seen() {
        let targets = make_targets(&["http://a:8080", "http://b:8080"]);
        let lb = LoadBalancer::new(BalanceDiscipline::LeastConn, targets);
        assert_eq!(lb.next().unwrap().label(), "http://a:8080");
    }

    #[test]
    fn random_only_selects_live_targets() {
        let targets = make_targets(&["http://a:8080", "http://b:8080", "http://c:8080"]);
        let lb = LoadBalancer::new(BalanceDiscipline::Random, targets.clone());
        lb.mark_live(&targets[2], false);

        for _ in 0..100 {
            let picked = lb.next().unwrap();
            assert_ne!(picked.label(), "http://c:8080");
        }
    }

    #[test]
    fn weighted_round_robin_follows_weights_exactly() {
        let targets: Vec<Arc<Target>> = [("http://a:8080", 5), ("http://b:8080", 3), ("http://c:8080", 1)]
            .iter()
            .map(|(u, w)| Arc::new(Target::new(u.parse().unwrap(), *w)))
            .collect();
        let lb = LoadBalancer::new(BalanceDiscipline::WeightedRoundRobin, targets);

        let seen = tally(&lb, 9);
        assert_eq!(seen["http://a:8080"], 5);
        assert_eq!(seen["http://b:8080"], 3);
        assert_eq!(seen["http://c:8080"], 1);
    }

    #[test]
    fn weighted_round_robin_interleaves() {
        let targets: Vec<Arc<Target>> = [("http://a:8080", 2), ("http://b:8080", 1)]
            .iter()
            .map(|(u, w)| Arc::new(Target::new(u.parse().unwrap(), *w)))
            .collect();
        let lb = LoadBalancer::new(BalanceDiscipline::WeightedRoundRobin, targets);

        let seen = tally(&lb, 6);
        assert_eq!(seen["http://a:8080"], 4);
        assert_eq!(seen["http://b:8080"], 2);
    }

    #[test]
    fn weighted_round_robin_never_picks_zero_weight() {
        let targets = vec![
            Arc::new(Target::with_exact_weight("http://a:8080".parse().unwrap(), 5)),
            Arc::new(Target::with_exact_weight("http://b:8080".parse().unwrap(), 0)),
            Arc::new(Target::with_exact_weight("http://c:8080".parse().unwrap(), 3)),
        ];
        let lb = LoadBalancer::new(BalanceDiscipline::WeightedRoundRobin, targets);

        let seen = tally(&lb, 40);
        assert_eq!(seen.get("http://b:8080"), None);
    }

    #[test]
    fn weighted_round_robin_skips_dead_mid_cycle() {
        let targets: Vec<Arc<Target>> = [("http://a:8080", 2), ("http://b:8080", 2)]
            .iter()
            .map(|(u, w)| Arc::new(Target::new(u.parse().unwrap(), *w)))
            .collect();
        let lb = LoadBalancer::new(BalanceDiscipline::WeightedRoundRobin, targets.clone());
        lb.mark_live(&targets[1], false);

        for _ in 0..8 {
            let picked = lb.next().unwrap();
            assert!(picked.is_live(), "dead target selected mid-cycle");
            assert_eq!(picked.label(), "http://a:8080");
        }
    }

    #[test]
    fn empty_target_set_yields_none() {
        for discipline in [
            BalanceDiscipline::RoundRobin,
            BalanceDiscipline::LeastConn,
            BalanceDiscipline::Random,
            BalanceDiscipline::WeightedRoundRobin,
        ] {
            let lb = LoadBalancer::new(discipline, Vec::new());
            assert!(lb.next().is_none());
        }
    }

    #[test]
    fn target_weight_coercion() {
        let t = Target::new("http://a:8080".parse().unwrap(), -3);
        assert_eq!(t.weight(), 1);
        let t = Target::new("http://a:8080".parse().unwrap(), 0);
        assert_eq!(t.weight(), 1);
        let t = Target::new("http://a:8080".parse().unwrap(), 7);
        assert_eq!(t.weight(), 7);
    }

    #[test]
    fn connection_guard_balances_counter() {
        let target = Arc::new(Target::new("http://a:8080".parse().unwrap(), 1));
        assert_eq!(target.in_flight(), 0);
        {
            let _guard = ConnectionGuard::new(target.clone());
            assert_eq!(target.in_flight(), 1);
            let _second = ConnectionGuard::new(target.clone());
            assert_eq!(target.in_flight(), 2);
        }
        assert_eq!(target.in_flight(), 0);
    }

    #[test]
    fn liveness_flag_round_trips() {
        let target = Target::new("http://a:8080".parse().unwrap(), 1);
        assert!(target.is_live());
        target.set_live(false);
        assert!(!target.is_live());
        target.set_live(true);
        assert!(target.is_live());
    }
}
