//! Priority-ranked route matching with parameter extraction.
//!
//! Patterns are compiled once at construction: tokenised on `/`, each token
//! becoming a literal (case-insensitive), a named parameter (`:name` or
//! `{name}`), a single-component wildcard (`*`) or a terminal rest-wildcard
//! (`**`). Each compiled route gets a scalar priority so that more specific
//! patterns shadow less specific ones; the hot path does no string splitting
//! of patterns, only of the request path.
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use crate::config::models::{RouteConfig, RouteRateLimit};

/// Reserved capture key under which `**` binds the joined remainder.
pub const REST_CAPTURE_KEY: &str = "**";

/// One compiled pattern segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Lowered literal, compared case-insensitively.
    Literal(String),
    /// Named parameter capturing one path component.
    Param(String),
    /// `*`: matches exactly one path component.
    Wildcard,
    /// `**`: matches zero or more remaining components; terminal.
    Rest,
}

/// A compiled, immutable route.
#[derive(Debug)]
pub struct Route {
    pub name: String,
    /// Lowered host pattern; empty matches any host.
    pub host: String,
    /// The original path pattern as written in configuration.
    pub pattern: String,
    pub segments: Vec<Segment>,
    /// Uppercased allowed methods; contains `"*"` when any method is allowed.
    pub methods: HashSet<String>,
    pub upstream: String,
    pub strip_path: bool,
    pub headers: HashMap<String, String>,
    pub rate_limit: Option<RouteRateLimit>,
    pub timeout: Option<Duration>,
    /// Reserved: parsed from configuration but never acted on.
    pub retry_count: u32,
    priority: i32,
}

impl Route {
    fn compile(cfg: &RouteConfig) -> Self {
        let mut methods = HashSet::new();
        if cfg.methods.is_empty() {
            methods.insert("*".to_string());
        } else {
            for m in &cfg.methods {
                methods.insert(m.to_uppercase());
            }
        }

        let segments = parse_segments(&cfg.path);
        let priority = priority_of(&segments);

        Self {
            name: cfg.name.clone(),
            host: cfg.host.to_lowercase(),
            pattern: cfg.path.clone(),
            segments,
            methods,
            upstream: cfg.upstream.clone(),
            strip_path: cfg.strip_path,
            headers: cfg.headers.clone(),
            rate_limit: cfg.rate_limit,
            timeout: cfg.timeout,
            retry_count: cfg.retry_count,
            priority,
        }
    }

    /// Scalar match priority derived from the segment shape.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Whether this route allows the given (uppercased) method.
    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.contains("*") || self.methods.contains(method)
    }

    /// Remove the longest leading run of literal segments from `path` when
    /// `strip_path` is set. The remainder is what gets forwarded; an empty
    /// remainder becomes `/`.
    pub fn strip_prefix<'a>(&self, path: &'a str) -> &'a str {
        if !self.strip_path {
            return path;
        }

        // consume `/<literal>` pairs off the front of the original path
        let mut offset = 0;
        for seg in &self.segments {
            let Segment::Literal(lit) = seg else { break };
            if path.as_bytes().get(offset) != Some(&b'/') {
                break;
            }
            let start = offset + 1;
            let end = path[start..]
                .find('/')
                .map_or(path.len(), |idx| start + idx);
            if !path[start..end].eq_ignore_ascii_case(lit) {
                break;
            }
            offset = end;
        }

        if offset == 0 {
            return path;
        }
        let stripped = &path[offset..];
        if stripped.is_empty() { "/" } else { stripped }
    }
}

/// A successful match: the route plus captured parameters.
#[derive(Debug)]
pub struct RouteMatch {
    pub route: Arc<Route>,
    pub params: HashMap<String, String>,
}

/// Immutable matcher over a priority-sorted route list.
///
/// Construction compiles and sorts every pattern; matching is lock-free and
/// shared by reference across request tasks.
pub struct Router {
    routes: Vec<Arc<Route>>,
}

impl Router {
    /// Compile the configured routes and sort them by descending priority.
    /// Ties keep configuration order (stable sort).
    pub fn new(configs: &[RouteConfig]) -> Self {
        let mut routes: Vec<Arc<Route>> =
            configs.iter().map(|cfg| Arc::new(Route::compile(cfg))).collect();
        routes.sort_by(|a, b| b.priority().cmp(&a.priority()));
        Self { routes }
    }

    /// Find the first route matching `(host, method, path)` in priority
    /// order, returning it with captured parameters.
    pub fn match_request(&self, host: &str, method: &str, path: &str) -> Option<RouteMatch> {
        let host = normalize_host(host);
        let method = method.to_uppercase();

        for route in &self.routes {
            if !route.host.is_empty()
                && route.host != host
                && !match_wildcard_host(&route.host, &host)
            {
                continue;
            }

            if !route.allows_method(&method) {
                continue;
            }

            if let Some(params) = match_path(&route.segments, path) {
                return Some(RouteMatch {
                    route: route.clone(),
                    params,
                });
            }
        }

        None
    }

    /// Read-only view of the compiled routes in match order.
    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }
}

/// Tokenise a path pattern into compiled segments.
fn parse_segments(path: &str) -> Vec<Segment> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Vec::new();
    }

    trimmed
        .split('/')
        .map(|part| match part {
            "**" => Segment::Rest,
            "*" => Segment::Wildcard,
            _ if part.starts_with(':') => Segment::Param(part[1..].to_string()),
            _ if part.starts_with('{') && part.ends_with('}') && part.len() > 2 => {
                Segment::Param(part[1..part.len() - 1].to_string())
            }
            _ => Segment::Literal(part.to_lowercase()),
        })
        .collect()
}

/// Priority: `10 * segment_count`, plus `+3` per literal, `-2` per parameter
/// and `-5` per wildcard. Exact literal paths always beat parameterised
/// siblings of the same length; rest-wildcards are the last resort.
fn priority_of(segments: &[Segment]) -> i32 {
    let mut priority = segments.len() as i32 * 10;
    for seg in segments {
        priority += match seg {
            Segment::Literal(_) => 3,
            Segment::Param(_) => -2,
            Segment::Wildcard | Segment::Rest => -5,
        };
    }
    priority
}

/// Lower the host and drop any port suffix.
fn normalize_host(host: &str) -> String {
    let host = host.to_lowercase();
    match host.split_once(':') {
        Some((name, _port)) => name.to_string(),
        None => host,
    }
}

/// `*.example.com` matches any host ending in `.example.com`.
fn match_wildcard_host(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix('*') {
        Some(suffix) if pattern.starts_with("*.") => host.ends_with(suffix),
        _ => false,
    }
}

/// Walk segments and path components in lockstep. Returns the capture map on
/// success; the path must be fully consumed unless a rest-wildcard ended the
/// walk early.
fn match_path(segments: &[Segment], path: &str) -> Option<HashMap<String, String>> {
    let trimmed = path.trim_matches('/');

    if segments.is_empty() {
        return trimmed.is_empty().then(HashMap::new);
    }

    let parts: Vec<&str> = if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('/').collect()
    };

    let mut params = HashMap::new();
    let mut pi = 0;

    for seg in segments {
        match seg {
            Segment::Rest => {
                if pi < parts.len() {
                    params.insert(REST_CAPTURE_KEY.to_string(), parts[pi..].join("/"));
                }
                return Some(params);
            }
            Segment::Wildcard => {
                if pi >= parts.len() {
                    return None;
                }
                pi += 1;
            }
            Segment::Param(name) => {
                if pi >= parts.len() {
                    return None;
                }
                params.insert(name.clone(), parts[pi].to_string());
                pi += 1;
            }
            Segment::Literal(lit) => {
                if pi >= parts.len() || parts[pi].to_lowercase() != *lit {
                    return None;
                }
                pi += 1;
            }
        }
    }

    (pi == parts.len()).then_some(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: &str, upstream: &str) -> RouteConfig {
        RouteConfig {
            name: String::new(),
            host: String::new(),
            path: path.to_string(),
            methods: Vec::new(),
            upstream: upstream.to_string(),
            strip_path: false,
            headers: HashMap::new(),
            rate_limit: None,
            timeout: None,
            retry_count: 0,
        }
    }

    #[test]
    fn parses_segment_kinds() {
        let segments = parse_segments("/api/:id/{name}/*/**");
        assert_eq!(
            segments,
            vec![
                Segment::Literal("api".to_string()),
                Segment::Param("id".to_string()),
                Segment::Param("name".to_string()),
                Segment::Wildcard,
                Segment::Rest,
            ]
        );
    }

    #[test]
    fn empty_pattern_matches_only_root() {
        let segments = parse_segments("/");
        assert!(segments.is_empty());
        assert!(match_path(&segments, "/").is_some());
        assert!(match_path(&segments, "/anything").is_none());
    }

    #[test]
    fn priority_prefers_literals() {
        let exact = priority_of(&parse_segments("/api/v1/users"));
        let single = priority_of(&parse_segments("/api/v1/*"));
        let param = priority_of(&parse_segments("/api/v1/:id"));
        let rest = priority_of(&parse_segments("/api/**"));

        assert!(exact > single);
        assert!(exact > param);
        assert!(param > single);
        assert!(single > rest);
    }

    #[test]
    fn matches_paths_by_priority() {
        let router = Router::new(&[
            route("/api/v1/users", "users"),
            route("/api/v1/users/*", "users"),
            route("/api/v1/orders/:id", "orders"),
            route("/api/**", "catchall"),
        ]);

        let cases = [
            ("/api/v1/users", "users"),
            ("/api/v1/users/123", "users"),
            ("/api/v1/orders/456", "orders"),
            ("/api/v2/anything/here", "catchall"),
            ("/api/v1/unknown", "catchall"),
        ];

        for (path, expected) in cases {
            let matched = router
                .match_request("", "GET", path)
                .unwrap_or_else(|| panic!("path {path} should match"));
            assert_eq!(matched.route.upstream, expected, "path {path}");
        }
    }

    #[test]
    fn more_specific_routes_shadow_less_specific() {
        let router = Router::new(&[
            route("/**", "catchall"),
            route("/api/**", "api"),
            route("/api/v1/users", "users-exact"),
            route("/api/v1/*", "v1"),
        ]);

        let cases = [
            ("/api/v1/users", "users-exact"),
            ("/api/v1/orders", "v1"),
            ("/api/v2/test", "api"),
            ("/other/path", "catchall"),
        ];

        for (path, expected) in cases {
            let matched = router.match_request("", "GET", path).unwrap();
            assert_eq!(matched.route.upstream, expected, "path {path}");
        }
    }

    #[test]
    fn host_matching_with_wildcards() {
        let mut with_host = route("/*", "api");
        with_host.host = "api.example.com".to_string();
        let mut wildcard = route("/*", "wildcard");
        wildcard.host = "*.example.com".to_string();
        let default = route("/*", "default");

        let router = Router::new(&[with_host, wildcard, default]);

        let cases = [
            ("api.example.com", "api"),
            ("test.example.com", "wildcard"),
            ("other.com", "default"),
        ];
        for (host, expected) in cases {
            let matched = router.match_request(host, "GET", "/test").unwrap();
            assert_eq!(matched.route.upstream, expected, "host {host}");
        }
    }

    #[test]
    fn host_is_matched_without_port_and_case_insensitively() {
        let mut cfg = route("/*", "api");
        cfg.host = "API.Example.Com".to_string();
        let router = Router::new(&[cfg]);

        assert!(router.match_request("api.example.com:8080", "GET", "/x").is_some());
        assert!(router.match_request("API.EXAMPLE.COM", "GET", "/x").is_some());
        assert!(router.match_request("other.com", "GET", "/x").is_none());
    }

    #[test]
    fn method_filtering() {
        let mut read = route("/api/read", "read");
        read.methods = vec!["GET".to_string()];
        let mut write = route("/api/write", "write");
        write.methods = vec!["POST".to_string(), "PUT".to_string()];
        let any = route("/api/any", "any");

        let router = Router::new(&[read, write, any]);

        assert!(router.match_request("", "GET", "/api/read").is_some());
        assert!(router.match_request("", "POST", "/api/read").is_none());
        assert!(router.match_request("", "POST", "/api/write").is_some());
        assert!(router.match_request("", "PUT", "/api/write").is_some());
        assert!(router.match_request("", "DELETE", "/api/write").is_none());
        assert!(router.match_request("", "DELETE", "/api/any").is_some());
        // lower-case request methods are uppercased before comparison
        assert!(router.match_request("", "get", "/api/read").is_some());
    }

    #[test]
    fn captures_named_params() {
        let router = Router::new(&[route("/users/:id/orders/:order_id", "orders")]);

        let matched = router
            .match_request("", "GET", "/users/123/orders/456")
            .unwrap();
        assert_eq!(matched.params["id"], "123");
        assert_eq!(matched.params["order_id"], "456");
    }

    #[test]
    fn rest_wildcard_binds_remainder() {
        let router = Router::new(&[route("/files/**", "files")]);

        let matched = router.match_request("", "GET", "/files/a/b/c.txt").unwrap();
        assert_eq!(matched.params[REST_CAPTURE_KEY], "a/b/c.txt");

        // `**` matches zero components; nothing is bound then.
        let matched = router.match_request("", "GET", "/files").unwrap();
        assert!(!matched.params.contains_key(REST_CAPTURE_KEY));
    }

    #[test]
    fn single_wildcard_requires_a_component() {
        let router = Router::new(&[route("/api/v1/*", "v1")]);
        assert!(router.match_request("", "GET", "/api/v1/users").is_some());
        assert!(router.match_request("", "GET", "/api/v1").is_none());
        assert!(router.match_request("", "GET", "/api/v1/users/123").is_none());
    }

    #[test]
    fn strip_prefix_removes_literal_run() {
        let mut cfg = route("/api/v1/*", "backend");
        cfg.strip_path = true;
        let compiled = Route::compile(&cfg);

        assert_eq!(compiled.strip_prefix("/api/v1/users/123"), "/users/123");
        assert_eq!(compiled.strip_prefix("/api/v1"), "/");
    }

    #[test]
    fn strip_prefix_is_identity_when_disabled() {
        let cfg = route("/api/v1/*", "backend");
        let compiled = Route::compile(&cfg);
        assert_eq!(compiled.strip_prefix("/api/v1/users"), "/api/v1/users");
    }

    #[test]
    fn strip_prefix_is_case_insensitive_and_tolerates_odd_paths() {
        let mut cfg = route("/api/v1/*", "backend");
        cfg.strip_path = true;
        let compiled = Route::compile(&cfg);

        assert_eq!(compiled.strip_prefix("/API/V1/users"), "/users");
        // a degenerate path that never carried the prefix stays untouched
        assert_eq!(compiled.strip_prefix("//api/v1/users"), "//api/v1/users");
    }

    #[test]
    fn strip_prefix_stops_at_first_non_literal() {
        let mut cfg = route("/api/:version/users", "backend");
        cfg.strip_path = true;
        let compiled = Route::compile(&cfg);
        assert_eq!(compiled.strip_prefix("/api/v2/users"), "/v2/users");
    }

    #[test]
    fn no_match_is_none() {
        let mut cfg = route("/specific", "specific");
        cfg.host = "specific.com".to_string();
        let router = Router::new(&[cfg]);
        assert!(router.match_request("other.com", "GET", "/other").is_none());
    }

    #[test]
    fn empty_route_set_never_matches() {
        let router = Router::new(&[]);
        assert!(router.match_request("", "GET", "/").is_none());
        assert!(router.match_request("", "GET", "/anything").is_none());
    }

    #[test]
    fn priority_agreement_over_matching_pairs() {
        let configs = [
            route("/api/v1/users", "a"),
            route("/api/v1/:id", "b"),
            route("/api/*/users", "c"),
            route("/api/**", "d"),
        ];
        let router = Router::new(&configs);

        // The matched route must carry the maximum priority among all routes
        // that match the path.
        for path in ["/api/v1/users", "/api/v1/other", "/api/x/users", "/api/x/y/z"] {
            let matched = router.match_request("", "GET", path).unwrap();
            let best = router
                .routes()
                .iter()
                .filter(|r| match_path(&r.segments, path).is_some())
                .map(|r| r.priority())
                .max()
                .unwrap();
            assert_eq!(matched.route.priority(), best, "path {path}");
        }
    }
}
