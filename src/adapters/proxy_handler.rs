//! The per-request proxy pipeline.
//!
//! Composition per request: admin paths, route match, rate-limit tiers in
//! fixed order (route, apikey, ip), balancer selection with a post-selection
//! liveness check, URL and header rewrite, hop-by-hop scrubbing, streaming
//! forward, and metrics recording. The in-flight gauge and the target
//! connection counter are RAII guards so every exit path decrements them
//! exactly once.
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::body::Body;
use eyre::{Context, Result};
use http::{
    HeaderMap, StatusCode, Uri,
    header::{self, HeaderName, HeaderValue},
};
use hyper::{Request, Response};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    core::{GatewayService, balancer::ConnectionGuard, router::Route},
    ports::http_client::{UpstreamClient, UpstreamError},
    tracing_setup,
};

/// Default deadline for one upstream call; per-route `timeout` overrides it.
const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Hop-by-hop headers (RFC 7230 §6.1) scrubbed from both directions.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Gateway HTTP handler: admin surfaces plus the proxy pipeline.
pub struct ProxyHandler {
    gateway: Arc<GatewayService>,
    client: Arc<dyn UpstreamClient>,
}

struct ForwardResult {
    status: StatusCode,
    response: Option<Response<Body>>,
    transport_error: bool,
    upstream_elapsed: Duration,
}

impl ProxyHandler {
    pub fn new(gateway: Arc<GatewayService>, client: Arc<dyn UpstreamClient>) -> Self {
        Self { gateway, client }
    }

    /// Entry point: wraps dispatch in a request span and logs completion.
    pub async fn handle_request(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<Body>> {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let request_id = Uuid::new_v4().to_string();
        let client_ip = client_addr.map(|addr| addr.ip().to_string());

        let span = tracing_setup::request_span(
            method.as_str(),
            &path,
            &request_id,
            client_ip.as_deref(),
        );

        let result = async { self.dispatch(req, client_addr).await }
            .instrument(span.clone())
            .await;

        let duration = started.elapsed();
        match &result {
            Ok(response) => {
                span.record("http.status_code", response.status().as_u16());
                span.record("duration_ms", duration.as_millis() as u64);
                tracing::info!(
                    status = response.status().as_u16(),
                    duration_ms = duration.as_millis() as u64,
                    "request completed"
                );
            }
            Err(e) => {
                span.record("http.status_code", 500u16);
                tracing::error!(
                    error = %e,
                    duration_ms = duration.as_millis() as u64,
                    "request failed"
                );
            }
        }

        result
    }

    async fn dispatch(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<Body>> {
        match req.uri().path() {
            "/health" => self.handle_health(),
            "/stats" => self.handle_stats(),
            _ => self.proxy_request(req, client_addr).await,
        }
    }

    fn handle_health(&self) -> Result<Response<Body>> {
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"status":"healthy"}"#))
            .wrap_err("failed to build health response")
    }

    fn handle_stats(&self) -> Result<Response<Body>> {
        let stats = self.gateway.usage().stats();
        let payload = serde_json::to_string(&stats).wrap_err("failed to serialize usage stats")?;
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload))
            .wrap_err("failed to build stats response")
    }

    async fn proxy_request(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<Body>> {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let host = request_host(&req);
        let metrics = self.gateway.metrics().clone();

        let Some(matched) = self
            .gateway
            .router()
            .match_request(&host, method.as_str(), &path)
        else {
            metrics.record_error("unknown", "not_found");
            return status_response(StatusCode::NOT_FOUND);
        };
        let route = matched.route;
        let route_name = if route.name.is_empty() {
            route.pattern.clone()
        } else {
            route.name.clone()
        };
        tracing::Span::current().record("route.name", route_name.as_str());

        let _in_flight = metrics.in_flight(&route_name);

        let client_ip = client_ip(req.headers(), client_addr);
        let (api_key, api_key_name) = self.extract_api_key(&req);

        if self.gateway.config().rate_limit.enabled {
            if let Some(tier) = self.rejected_tier(&route, &route_name, &client_ip, &api_key) {
                metrics.record_rate_limit_hit(&route_name, tier);
                return rate_limited_response();
            }
        }

        let Some(balancer) = self.gateway.balancer(&route.upstream) else {
            metrics.record_error(&route_name, "upstream_not_found");
            return status_response(StatusCode::BAD_GATEWAY);
        };

        let Some(target) = balancer.next() else {
            metrics.record_error(&route_name, "no_healthy_upstream");
            return status_response(StatusCode::SERVICE_UNAVAILABLE);
        };
        // next() hands back a fallback target when nothing is live so that
        // recovery probes keep a destination; a dead selection is a 503 here.
        if !target.is_live() {
            metrics.record_error(&route_name, "no_healthy_upstream");
            return status_response(StatusCode::SERVICE_UNAVAILABLE);
        }

        let conn_guard = ConnectionGuard::new(target.clone());
        let forwarded = self.forward(req, &route, conn_guard.target(), &client_ip).await?;
        // decrement the target counter before the duration observations
        drop(conn_guard);

        let duration = started.elapsed();
        let status = forwarded.status;
        let is_error = status.as_u16() >= 400;

        metrics.record_request(&route_name, method.as_str(), status.as_u16(), duration);
        metrics.record_upstream_duration(&route.upstream, forwarded.upstream_elapsed);
        self.gateway.usage().record(&route_name, duration, is_error);

        if !api_key_name.is_empty() {
            metrics.record_api_key_request(&api_key_name, status.as_u16());
            self.gateway
                .usage()
                .record(&format!("apikey:{api_key_name}"), duration, is_error);
        }

        if forwarded.transport_error {
            metrics.record_error(&route_name, "proxy_error");
        }

        match forwarded.response {
            Some(response) => Ok(response),
            None => status_response(status),
        }
    }

    /// Rewrite the request for its target and send it. Cancellation maps to
    /// status 499 (not a transport error); any other failure maps to 502.
    async fn forward(
        &self,
        req: Request<Body>,
        route: &Route,
        target: &Arc<crate::core::Target>,
        client_ip: &str,
    ) -> Result<ForwardResult> {
        let original_host = request_host(&req);
        let raw_path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);
        let forwarded_proto = req
            .headers()
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("http")
            .to_string();

        let stripped = route.strip_prefix(&raw_path);
        let upstream_path = single_join(target.url().path(), stripped);
        let path_and_query = match &query {
            Some(q) => format!("{upstream_path}?{q}"),
            None => upstream_path,
        };

        let uri: Uri = Uri::builder()
            .scheme(target.url().scheme_str().unwrap_or("http"))
            .authority(
                target
                    .url()
                    .authority()
                    .map(|a| a.as_str())
                    .unwrap_or_default(),
            )
            .path_and_query(path_and_query.as_str())
            .build()
            .wrap_err("failed to build upstream URI")?;

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;

        let headers = &mut parts.headers;
        apply_header_overrides(headers, &route.headers);
        set_forwarding_headers(headers, client_ip, &original_host, &forwarded_proto);
        scrub_hop_headers(headers);

        let deadline = route.timeout.unwrap_or(DEFAULT_UPSTREAM_TIMEOUT);
        let span =
            tracing_setup::upstream_span(&target.label(), parts.method.as_str(), parts.uri.path());
        let upstream_started = Instant::now();
        let result = self
            .client
            .forward(Request::from_parts(parts, body), deadline)
            .instrument(span.clone())
            .await;
        let upstream_elapsed = upstream_started.elapsed();

        match result {
            Ok(mut response) => {
                span.record("http.status_code", response.status().as_u16());
                scrub_hop_headers(response.headers_mut());
                Ok(ForwardResult {
                    status: response.status(),
                    response: Some(response),
                    transport_error: false,
                    upstream_elapsed,
                })
            }
            Err(UpstreamError::Canceled) => {
                tracing::debug!("downstream client canceled mid-flight");
                Ok(ForwardResult {
                    status: StatusCode::from_u16(499)?,
                    response: None,
                    transport_error: false,
                    upstream_elapsed,
                })
            }
            Err(e) => {
                tracing::error!(error = %e, target = %target.label(), "upstream call failed");
                Ok(ForwardResult {
                    status: StatusCode::BAD_GATEWAY,
                    response: None,
                    transport_error: true,
                    upstream_elapsed,
                })
            }
        }
    }

    /// Evaluate the rate-limit tiers in fixed order; the first tier that
    /// rejects names the rejection.
    fn rejected_tier(
        &self,
        route: &Route,
        route_name: &str,
        client_ip: &str,
        api_key: &str,
    ) -> Option<&'static str> {
        let limiter = self.gateway.rate_limiter();
        let settings = &self.gateway.config().rate_limit;

        if let Some(limit) = &route.rate_limit {
            if limit.enabled
                && !limiter.allow_with_limits(
                    &format!("route:{route_name}"),
                    limit.requests_per_second,
                    limit.burst_size,
                )
            {
                return Some("route");
            }
        }

        if settings.per_api_key
            && !api_key.is_empty()
            && !limiter.allow(&format!("apikey:{api_key}"))
        {
            return Some("apikey");
        }

        if settings.per_ip && !client_ip.is_empty() && !limiter.allow(&format!("ip:{client_ip}")) {
            return Some("ip");
        }

        None
    }

    /// Rate-limit identity: `Authorization` bearer/ApiKey scheme, then
    /// `X-API-Key`, then the `api_key` query parameter. Returns the raw key
    /// plus the configured client name when recognised.
    fn extract_api_key(&self, req: &Request<Body>) -> (String, String) {
        let mut key = String::new();

        if let Some(auth) = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        {
            if let Some(rest) = auth.strip_prefix("Bearer ") {
                key = rest.to_string();
            } else if let Some(rest) = auth.strip_prefix("ApiKey ") {
                key = rest.to_string();
            }
        }

        if key.is_empty() {
            if let Some(header_key) = req
                .headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
            {
                key = header_key.to_string();
            }
        }

        if key.is_empty() {
            if let Some(query) = req.uri().query() {
                for pair in query.split('&') {
                    if let Some(("api_key", value)) = pair.split_once('=') {
                        key = value.to_string();
                        break;
                    }
                }
            }
        }

        if !key.is_empty() {
            if let Some(client) = self.gateway.resolve_api_key(&key) {
                return (key, client.name.clone());
            }
        }

        (key, String::new())
    }
}

/// Apply route-configured header overrides; last write wins.
fn apply_header_overrides(headers: &mut HeaderMap, overrides: &std::collections::HashMap<String, String>) {
    for (name, value) in overrides {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "skipping invalid route header override"),
        }
    }
}

/// Maintain the forwarding headers on the upstream request.
fn set_forwarding_headers(
    headers: &mut HeaderMap,
    client_ip: &str,
    original_host: &str,
    forwarded_proto: &str,
) {
    let forwarded_for = match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .filter(|prior| !prior.is_empty())
    {
        Some(prior) => format!("{prior}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }

    if !original_host.is_empty() {
        if let Ok(value) = HeaderValue::from_str(original_host) {
            headers.insert("x-forwarded-host", value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(forwarded_proto) {
        headers.insert("x-forwarded-proto", value);
    }

    if let Ok(value) = HeaderValue::from_str(client_ip) {
        headers.insert("x-real-ip", value);
    }
}

/// Remove every hop-by-hop header.
pub fn scrub_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Join two path fragments with exactly one `/` between them.
pub fn single_join(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

/// Client address: first `X-Forwarded-For` element, else `X-Real-IP`, else
/// the connection remote address with the port stripped.
fn client_ip(headers: &HeaderMap, client_addr: Option<SocketAddr>) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    client_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default()
}

/// The request's host, from the `Host` header or the URI authority.
fn request_host(req: &Request<Body>) -> String {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

/// A complete response with a short plain-text body matching the status
/// reason phrase.
fn status_response(status: StatusCode) -> Result<Response<Body>> {
    let reason = status.canonical_reason().unwrap_or(if status.as_u16() == 499 {
        "Client Closed Request"
    } else {
        ""
    });
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(reason))
        .wrap_err("failed to build status response")
}

fn rate_limited_response() -> Result<Response<Body>> {
    Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header(header::RETRY_AFTER, "1")
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from("Too Many Requests"))
        .wrap_err("failed to build rate limited response")
}
