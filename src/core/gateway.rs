//! Core gateway orchestration service.
//!
//! `GatewayService` aggregates the immutable pieces built once from
//! configuration: the compiled route matcher, one load balancer per
//! upstream, the rate-limit registry (pre-seeded with recognised API
//! clients), the API-key table, the metrics registry and the usage tracker.
//! It performs no I/O; the proxy handler and health checker drive it.
use std::{collections::HashMap, sync::Arc};

use eyre::{Context, Result};
use http::Uri;

use crate::{
    config::models::{ApiKeyConfig, GatewayConfig, HealthCheckConfig},
    core::{
        balancer::{LoadBalancer, Target},
        rate_limit::RateLimiter,
        router::Router,
    },
    metrics::{Metrics, UsageTracker},
};

pub struct GatewayService {
    config: Arc<GatewayConfig>,
    router: Router,
    upstreams: HashMap<String, Arc<LoadBalancer>>,
    rate_limiter: Arc<RateLimiter>,
    api_keys: HashMap<String, ApiKeyConfig>,
    metrics: Arc<Metrics>,
    usage: Arc<UsageTracker>,
}

impl GatewayService {
    /// Build the service from validated configuration. Target URLs are
    /// parsed here; a URL that fails to parse aborts construction.
    pub fn new(config: Arc<GatewayConfig>) -> Result<Self> {
        let router = Router::new(&config.routes);

        let mut upstreams = HashMap::new();
        for upstream in &config.upstreams {
            let mut targets = Vec::with_capacity(upstream.targets.len());
            for target in &upstream.targets {
                let uri: Uri = target
                    .url
                    .parse()
                    .wrap_err_with(|| format!("invalid upstream URL {}", target.url))?;
                targets.push(Arc::new(Target::new(uri, target.weight)));
            }
            upstreams.insert(
                upstream.name.clone(),
                Arc::new(LoadBalancer::new(upstream.load_balance, targets)),
            );
        }

        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit.default_rps,
            config.rate_limit.default_burst,
        ));

        let mut api_keys = HashMap::new();
        for key in &config.api_keys {
            if key.enabled {
                rate_limiter.set_limits(
                    &format!("apikey:{}", key.key),
                    key.requests_per_second,
                    key.burst_size,
                );
                api_keys.insert(key.key.clone(), key.clone());
            }
        }

        let metrics = Arc::new(Metrics::new(config.metrics.latency_buckets.clone()));

        Ok(Self {
            config,
            router,
            upstreams,
            rate_limiter,
            api_keys,
            metrics,
            usage: Arc::new(UsageTracker::new()),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Look up the balancer for an upstream name.
    pub fn balancer(&self, upstream: &str) -> Option<&Arc<LoadBalancer>> {
        self.upstreams.get(upstream)
    }

    /// All upstream balancers, keyed by name.
    pub fn upstreams(&self) -> &HashMap<String, Arc<LoadBalancer>> {
        &self.upstreams
    }

    /// Health policies declared in configuration, keyed by upstream name.
    pub fn health_policies(&self) -> HashMap<String, HealthCheckConfig> {
        self.config
            .upstreams
            .iter()
            .filter_map(|u| u.health_check.clone().map(|hc| (u.name.clone(), hc)))
            .collect()
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Resolve a raw API key to its configured client, if recognised.
    pub fn resolve_api_key(&self, key: &str) -> Option<&ApiKeyConfig> {
        self.api_keys.get(key)
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::{RouteConfig, TargetConfig, UpstreamConfig};

    fn config_with_upstream() -> GatewayConfig {
        GatewayConfig {
            upstreams: vec![UpstreamConfig {
                name: "backend".to_string(),
                targets: vec![
                    TargetConfig {
                        url: "http://localhost:9001".to_string(),
                        weight: 0,
                    },
                    TargetConfig {
                        url: "http://localhost:9002".to_string(),
                        weight: 5,
                    },
                ],
                load_balance: Default::default(),
                health_check: None,
            }],
            routes: vec![RouteConfig {
                name: "api".to_string(),
                host: String::new(),
                path: "/api/**".to_string(),
                methods: Vec::new(),
                upstream: "backend".to_string(),
                strip_path: false,
                headers: Default::default(),
                rate_limit: None,
                timeout: None,
                retry_count: 0,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn builds_balancers_with_coerced_weights() {
        let service = GatewayService::new(Arc::new(config_with_upstream())).unwrap();
        let balancer = service.balancer("backend").unwrap();
        let targets = balancer.targets();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].weight(), 1, "absent weight coerces to 1");
        assert_eq!(targets[1].weight(), 5);
        assert!(service.balancer("missing").is_none());
    }

    #[test]
    fn invalid_target_url_fails_construction() {
        let mut config = config_with_upstream();
        config.upstreams[0].targets[0].url = "http://[bad".to_string();
        assert!(GatewayService::new(Arc::new(config)).is_err());
    }

    #[test]
    fn enabled_api_keys_are_seeded_with_custom_limits() {
        let mut config = config_with_upstream();
        config.api_keys = vec![
            ApiKeyConfig {
                key: "secret-1".to_string(),
                name: "alice".to_string(),
                requests_per_second: 2,
                burst_size: 2,
                enabled: true,
            },
            ApiKeyConfig {
                key: "secret-2".to_string(),
                name: "bob".to_string(),
                requests_per_second: 100,
                burst_size: 100,
                enabled: false,
            },
        ];

        let service = GatewayService::new(Arc::new(config)).unwrap();
        assert_eq!(service.resolve_api_key("secret-1").unwrap().name, "alice");
        assert!(service.resolve_api_key("secret-2").is_none());

        // alice's bucket carries her limits, not the defaults
        let limiter = service.rate_limiter();
        assert!(limiter.allow("apikey:secret-1"));
        assert!(limiter.allow("apikey:secret-1"));
        assert!(!limiter.allow("apikey:secret-1"));
    }

    #[test]
    fn health_policies_only_cover_declaring_upstreams() {
        let mut config = config_with_upstream();
        config.upstreams.push(UpstreamConfig {
            name: "probed".to_string(),
            targets: vec![TargetConfig {
                url: "http://localhost:9100".to_string(),
                weight: 0,
            }],
            load_balance: Default::default(),
            health_check: Some(Default::default()),
        });

        let service = GatewayService::new(Arc::new(config)).unwrap();
        let policies = service.health_policies();
        assert_eq!(policies.len(), 1);
        assert!(policies.contains_key("probed"));
    }
}
