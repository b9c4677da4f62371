//! Gantry - a reverse-proxy API gateway.
//!
//! Gantry terminates client HTTP requests, matches them to a configured
//! route, selects a healthy upstream target under a chosen load-balancing
//! discipline, enforces multi-tier token-bucket rate limits, forwards the
//! request, and records observability signals.
//!
//! # Features
//! - Priority-ranked path/host/method routing with parameter extraction
//!   (`:name`, `{name}`, `*`, `**`)
//! - Four load-balancing disciplines: round-robin, least-connections,
//!   random, smooth weighted round-robin, all liveness-aware
//! - Token-bucket rate limiting per route, API key and client IP with
//!   idle-bucket reclamation
//! - Periodic out-of-band health probing per upstream
//! - Concurrent metrics registry with Prometheus text and JSON exposition,
//!   plus per-key usage quantiles on `/stats`
//! - Graceful shutdown with bounded draining
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters**
//! (implementations) while keeping business logic inside `core`. The binary
//! crate wires the pieces; embedders can compose them directly:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use gantry::{
//!     adapters::{ProxyHandler, ProxyHttpClient},
//!     config,
//!     core::GatewayService,
//!     ports::http_client::UpstreamClient,
//! };
//!
//! # fn main() -> eyre::Result<()> {
//! let cfg = config::load_config("gantry.yml")?;
//! let gateway = Arc::new(GatewayService::new(Arc::new(cfg))?);
//! let client: Arc<dyn UpstreamClient> = Arc::new(ProxyHttpClient::new()?);
//! let handler = ProxyHandler::new(gateway, client);
//! # let _ = handler;
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Fallible APIs return `eyre::Result<T>` or a domain-specific error type
//! (`config::ValidationError`, `ports::http_client::UpstreamError`).
//!
//! # License
//! Dual-licensed under either MIT or Apache-2.0 at your option.
pub mod adapters;
pub mod config;
pub mod core;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub use crate::{
    adapters::{HealthChecker, ProxyHandler, ProxyHttpClient},
    core::GatewayService,
    ports::http_client::UpstreamClient,
    utils::GracefulShutdown,
};
