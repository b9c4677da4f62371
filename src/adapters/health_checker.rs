//! Out-of-band health probing.
//!
//! One task per upstream that declares a health-check policy. Each task runs
//! an immediate initial sweep, then probes on a fixed interval; within a
//! sweep the targets are probed sequentially. A probe succeeds when the
//! response status is in `[200, 400)` before the timeout; any other outcome
//! marks the target not-live. The checker only writes atomic liveness flags
//! and the health gauge, so it never blocks the request hot path.
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::{
    config::models::HealthCheckConfig,
    core::{GatewayService, LoadBalancer},
    ports::http_client::UpstreamClient,
    utils::graceful_shutdown::ShutdownToken,
};

pub struct HealthChecker {
    gateway: Arc<GatewayService>,
    client: Arc<dyn UpstreamClient>,
}

/// Handles of the running checker tasks; `shutdown` awaits them all so the
/// process never exits mid-sweep.
pub struct HealthSupervisor {
    handles: Vec<JoinHandle<()>>,
}

impl HealthSupervisor {
    /// Wait for every checker task to acknowledge termination.
    pub async fn shutdown(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "health checker task panicked");
            }
        }
        tracing::info!("health checker stopped");
    }

    pub fn task_count(&self) -> usize {
        self.handles.len()
    }
}

impl HealthChecker {
    pub fn new(gateway: Arc<GatewayService>, client: Arc<dyn UpstreamClient>) -> Self {
        Self { gateway, client }
    }

    /// Spawn one probing task per upstream with a policy.
    pub fn spawn(self, shutdown: &ShutdownToken) -> HealthSupervisor {
        let checker = Arc::new(self);
        let mut handles = Vec::new();

        for (name, policy) in checker.gateway.health_policies() {
            let Some(balancer) = checker.gateway.balancer(&name).cloned() else {
                continue;
            };
            tracing::info!(
                upstream = %name,
                path = %policy.path,
                interval = ?policy.interval,
                "starting health checker"
            );
            let checker = checker.clone();
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                checker.run_upstream(name, balancer, policy, token).await;
            }));
        }

        HealthSupervisor { handles }
    }

    async fn run_upstream(
        &self,
        name: String,
        balancer: Arc<LoadBalancer>,
        policy: HealthCheckConfig,
        mut shutdown: ShutdownToken,
    ) {
        let mut ticker = tokio::time::interval(policy.interval);
        // consume the interval's immediate first tick; the initial sweep
        // below covers task start
        ticker.tick().await;

        self.sweep(&name, &balancer, &policy).await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep(&name, &balancer, &policy).await;
                }
                _ = shutdown.wait() => {
                    tracing::debug!(upstream = %name, "health checker task stopping");
                    return;
                }
            }
        }
    }

    /// Probe every target of one upstream, in order.
    async fn sweep(&self, name: &str, balancer: &LoadBalancer, policy: &HealthCheckConfig) {
        for target in balancer.targets() {
            let url = format!("{}{}", target.label(), policy.path);
            let healthy = self.client.probe(&url, policy.timeout).await;

            balancer.mark_live(target, healthy);
            self.gateway
                .metrics()
                .record_upstream_health(name, &target.label(), healthy);

            if healthy {
                tracing::debug!(upstream = %name, target = %target.label(), "probe ok");
            } else {
                tracing::warn!(upstream = %name, target = %target.label(), "upstream unhealthy");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Mutex,
        time::Duration,
    };

    use async_trait::async_trait;
    use axum::body::Body;
    use hyper::{Request, Response};

    use super::*;
    use crate::{
        config::models::{GatewayConfig, RouteConfig, TargetConfig, UpstreamConfig},
        ports::http_client::UpstreamResult,
        utils::graceful_shutdown::GracefulShutdown,
    };

    struct ScriptedProbe {
        results: Mutex<Vec<bool>>,
        probed_urls: Mutex<Vec<String>>,
    }

    impl ScriptedProbe {
        fn new(results: Vec<bool>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results),
                probed_urls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl UpstreamClient for ScriptedProbe {
        async fn forward(
            &self,
            _req: Request<Body>,
            _deadline: Duration,
        ) -> UpstreamResult<Response<Body>> {
            unreachable!("health checker never forwards")
        }

        async fn probe(&self, url: &str, _timeout: Duration) -> bool {
            self.probed_urls.lock().unwrap().push(url.to_string());
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                results.remove(0)
            } else {
                *results.first().unwrap_or(&true)
            }
        }
    }

    fn probed_config(interval: Duration) -> GatewayConfig {
        GatewayConfig {
            upstreams: vec![UpstreamConfig {
                name: "backend".to_string(),
                targets: vec![TargetConfig {
                    url: "http://127.0.0.1:9601".to_string(),
                    weight: 0,
                }],
                load_balance: Default::default(),
                health_check: Some(HealthCheckConfig {
                    path: "/health".to_string(),
                    interval,
                    timeout: Duration::from_millis(100),
                }),
            }],
            routes: vec![RouteConfig {
                name: "api".to_string(),
                host: String::new(),
                path: "/**".to_string(),
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

    #[tokio::test(flavor = "multi_thread")]
    async fn initial_sweep_runs_immediately_and_flips_liveness() {
        let gateway =
            Arc::new(GatewayService::new(Arc::new(probed_config(Duration::from_secs(60)))).unwrap());
        let client = ScriptedProbe::new(vec![false]);
        let shutdown = GracefulShutdown::new();

        let checker = HealthChecker::new(gateway.clone(), client.clone());
        let supervisor = checker.spawn(&shutdown.token());
        assert_eq!(supervisor.task_count(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;

        let target = &gateway.balancer("backend").unwrap().targets()[0];
        assert!(!target.is_live(), "failed probe must mark target dead");
        assert_eq!(
            client.probed_urls.lock().unwrap()[0],
            "http://127.0.0.1:9601/health"
        );

        let snapshot = gateway.metrics().json_snapshot();
        assert_eq!(
            snapshot["upstream_health"]["backend_http://127.0.0.1:9601"],
            0
        );

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), supervisor.shutdown())
            .await
            .expect("supervisor must stop after shutdown");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recovery_restores_liveness_on_next_tick() {
        let gateway = Arc::new(
            GatewayService::new(Arc::new(probed_config(Duration::from_millis(50)))).unwrap(),
        );
        // first probe fails, subsequent probes succeed
        let client = ScriptedProbe::new(vec![false, true]);
        let shutdown = GracefulShutdown::new();

        let checker = HealthChecker::new(gateway.clone(), client);
        let supervisor = checker.spawn(&shutdown.token());

        let target = gateway.balancer("backend").unwrap().targets()[0].clone();

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(!target.is_live());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(target.is_live(), "successful probe must restore liveness");

        shutdown.trigger();
        supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upstream_without_policy_gets_no_task() {
        let mut config = probed_config(Duration::from_secs(60));
        config.upstreams[0].health_check = None;
        let gateway = Arc::new(GatewayService::new(Arc::new(config)).unwrap());
        let shutdown = GracefulShutdown::new();

        let checker = HealthChecker::new(gateway, ScriptedProbe::new(vec![true]));
        let supervisor = checker.spawn(&shutdown.token());
        assert_eq!(supervisor.task_count(), 0);
        supervisor.shutdown().await;
    }
}
