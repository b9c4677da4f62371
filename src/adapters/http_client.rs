use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use eyre::Result;
use hyper::{Request, Response, Version, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::ports::http_client::{UpstreamClient, UpstreamError, UpstreamResult};

/// Default connect timeout for new upstream connections.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// TCP keep-alive probe interval on pooled connections.
const KEEP_ALIVE: Duration = Duration::from_secs(30);
/// How long an idle pooled connection may linger.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// Idle connection cap per upstream host.
const POOL_MAX_IDLE_PER_HOST: usize = 10;

/// Shared upstream HTTP client over Hyper with Rustls.
///
/// One bounded connection pool serves every upstream; backpressure under
/// pool saturation surfaces as call timeouts. The adapter converts between
/// the axum body type on both sides and classifies transport failures so the
/// pipeline can distinguish client cancellation from upstream faults.
pub struct ProxyHttpClient {
    client: Client<HttpsConnector<HttpConnector>, Body>,
}

impl ProxyHttpClient {
    pub fn new() -> Result<Self> {
        // Install the default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // allow https targets
        http_connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
        http_connector.set_keepalive(Some(KEEP_ALIVE));

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("failed to add native certificate to root store");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build::<_, Body>(https_connector);

        Ok(Self { client })
    }
}

#[async_trait]
impl UpstreamClient for ProxyHttpClient {
    async fn forward(
        &self,
        mut req: Request<Body>,
        deadline: Duration,
    ) -> UpstreamResult<Response<Body>> {
        let host_header = match (req.uri().host(), req.uri().port()) {
            (Some(host), Some(port)) => HeaderValue::from_str(&format!("{host}:{port}")),
            (Some(host), None) => HeaderValue::from_str(host),
            (None, _) => {
                return Err(UpstreamError::InvalidRequest(
                    "outgoing URI has no host".to_string(),
                ));
            }
        }
        .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;
        req.headers_mut().insert(hyper::header::HOST, host_header);

        let (mut parts, body) = req.into_parts();
        // ALPN still negotiates h2 against https upstreams
        parts.version = Version::HTTP_11;
        let outgoing = Request::from_parts(parts, body);

        match timeout(deadline, self.client.request(outgoing)).await {
            Ok(Ok(response)) => {
                let (parts, incoming) = response.into_parts();
                Ok(Response::from_parts(parts, Body::new(incoming)))
            }
            Ok(Err(e)) => {
                if is_canceled(&e) {
                    Err(UpstreamError::Canceled)
                } else {
                    Err(UpstreamError::Connect(e.to_string()))
                }
            }
            Err(_) => Err(UpstreamError::Timeout(deadline)),
        }
    }

    async fn probe(&self, url: &str, probe_timeout: Duration) -> bool {
        let request = match Request::builder()
            .method("GET")
            .uri(url)
            .version(Version::HTTP_11)
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(e) => {
                tracing::debug!(url, error = %e, "failed to build health probe");
                return false;
            }
        };

        match timeout(probe_timeout, self.client.request(request)).await {
            Ok(Ok(response)) => (200..400).contains(&response.status().as_u16()),
            Ok(Err(e)) => {
                tracing::debug!(url, error = %e, "health probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(url, "health probe timed out");
                false
            }
        }
    }
}

/// Walk the error source chain looking for a canceled hyper error. The
/// legacy client wraps the hyper error, so a plain downcast is not enough.
fn is_canceled(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(hyper_err) = e.downcast_ref::<hyper::Error>() {
            if hyper_err.is_canceled() {
                return true;
            }
        }
        source = e.source();
    }
    false
}
