//! Configuration data structures for Gantry.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files.
//! They are intentionally serde-friendly and carry defaults so that minimal
//! configs remain concise. Durations are written as humantime strings
//! (`"30s"`, `"5m"`). Unknown keys at the top level are ignored; unknown keys
//! inside nested structures are a configuration error.
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

/// Serde helpers mapping humantime strings onto `std::time::Duration`.
pub(crate) mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw)
            .map_err(|e| D::Error::custom(format!("invalid duration '{raw}': {e}")))
    }
}

/// Same as [`duration_str`] for optional fields.
pub(crate) mod opt_duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.collect_str(&humantime::format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            Some(raw) => humantime::parse_duration(&raw)
                .map(Some)
                .map_err(|e| D::Error::custom(format!("invalid duration '{raw}': {e}"))),
            None => Ok(None),
        }
    }
}

/// Root configuration tree for the gateway process.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

/// Listener and lifecycle settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    #[serde(with = "duration_str")]
    pub read_timeout: Duration,
    #[serde(with = "duration_str")]
    pub write_timeout: Duration,
    #[serde(with = "duration_str")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// A named set of targets sharing a balancing discipline and health policy.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    pub name: String,
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub load_balance: BalanceDiscipline,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

/// One upstream target. A missing or non-positive weight defaults to 1 when
/// the target is constructed.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub url: String,
    #[serde(default)]
    pub weight: i64,
}

/// Selection discipline used by an upstream's load balancer.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalanceDiscipline {
    #[default]
    RoundRobin,
    LeastConn,
    Random,
    WeightedRoundRobin,
}

/// Out-of-band health probing policy for one upstream.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct HealthCheckConfig {
    pub path: String,
    #[serde(with = "duration_str")]
    pub interval: Duration,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
        }
    }
}

/// A single route: matcher plus forwarding directive.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    #[serde(default)]
    pub name: String,
    /// Literal host or leading-wildcard pattern (`*.example.com`); empty
    /// matches any host.
    #[serde(default)]
    pub host: String,
    pub path: String,
    /// Allowed methods; empty allows all.
    #[serde(default)]
    pub methods: Vec<String>,
    pub upstream: String,
    #[serde(default)]
    pub strip_path: bool,
    /// Static header overrides applied to the upstream request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub rate_limit: Option<RouteRateLimit>,
    /// Per-route upstream call deadline; overrides the client default.
    #[serde(default, with = "opt_duration_str")]
    pub timeout: Option<Duration>,
    /// Accepted but reserved; the gateway never retries upstream calls.
    #[serde(default)]
    pub retry_count: u32,
}

/// Inline per-route rate limit override.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct RouteRateLimit {
    pub enabled: bool,
    pub requests_per_second: u32,
    pub burst_size: u32,
}

/// Global rate limiting settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub default_rps: u32,
    pub default_burst: u32,
    pub per_ip: bool,
    pub per_api_key: bool,
    #[serde(with = "duration_str")]
    pub cleanup_interval: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_rps: 100,
            default_burst: 200,
            per_ip: true,
            per_api_key: true,
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// Metrics listener settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
    /// Upper bounds for the latency histograms; empty uses the built-in
    /// ladder.
    pub latency_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
            path: "/metrics".to_string(),
            latency_buckets: Vec::new(),
        }
    }
}

/// A recognised API client with its own rate-limit budget.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ApiKeyConfig {
    pub key: String,
    pub name: String,
    pub requests_per_second: u32,
    pub burst_size: u32,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.port, 8080);
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.read_timeout, Duration::from_secs(30));
        assert_eq!(server.shutdown_timeout, Duration::from_secs(10));
    }

    #[test]
    fn rate_limit_defaults() {
        let rl = RateLimitSettings::default();
        assert!(rl.enabled);
        assert_eq!(rl.default_rps, 100);
        assert_eq!(rl.default_burst, 200);
        assert!(rl.per_ip);
        assert!(rl.per_api_key);
        assert_eq!(rl.cleanup_interval, Duration::from_secs(300));
    }

    #[test]
    fn duration_strings_round_trip() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            #[serde(with = "duration_str")]
            d: Duration,
        }

        let w: Wrapper = serde_json::from_str(r#"{"d":"5m"}"#).unwrap();
        assert_eq!(w.d, Duration::from_secs(300));

        let json = serde_json::to_string(&Wrapper {
            d: Duration::from_secs(90),
        })
        .unwrap();
        assert_eq!(json, r#"{"d":"1m 30s"}"#);
    }

    #[test]
    fn route_defaults_allow_all_methods() {
        let route: RouteConfig =
            serde_json::from_str(r#"{"path": "/api/**", "upstream": "backend"}"#).unwrap();
        assert!(route.methods.is_empty());
        assert!(!route.strip_path);
        assert!(route.timeout.is_none());
        assert_eq!(route.retry_count, 0);
    }

    #[test]
    fn unknown_nested_key_is_rejected() {
        let result: Result<ServerConfig, _> =
            serde_json::from_str(r#"{"port": 8080, "bogus": true}"#);
        assert!(result.is_err());
    }
}
