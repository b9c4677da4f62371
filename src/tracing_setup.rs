use eyre::Result;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured JSON logging to stdout. The filter honours
/// `RUST_LOG` and defaults to `info`.
pub fn init_tracing() -> Result<()> {
    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_target(true),
        )
        .init();

    Ok(())
}

/// Create a request-scoped tracing span.
pub fn request_span(
    method: &str,
    path: &str,
    request_id: &str,
    client_ip: Option<&str>,
) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        request.id = request_id,
        client.ip = client_ip,
        route.name = tracing::field::Empty,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Create a span for one upstream call.
pub fn upstream_span(target: &str, method: &str, path: &str) -> tracing::Span {
    tracing::info_span!(
        "upstream_request",
        upstream.target = target,
        http.method = method,
        http.path = path,
        http.status_code = tracing::field::Empty,
    )
}
