use std::{convert::Infallible, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request},
    response::Response,
    routing::{any, get},
};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use gantry::{
    adapters::{HealthChecker, ProxyHandler, ProxyHttpClient},
    config::{GatewayConfigValidator, load_config},
    core::GatewayService,
    ports::http_client::UpstreamClient,
    tracing_setup,
    utils::GracefulShutdown,
};
use http::header;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Path to the configuration file
    #[clap(short, long, default_value = "gantry.yml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "gantry.yml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "gantry.yml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config),
    };

    if command == "validate" {
        return validate_config_command(&config_path);
    }

    tracing_setup::init_tracing().map_err(|e| eyre!("failed to initialize tracing: {e}"))?;

    tracing::info!(config = %config_path, "starting gantry");

    let config = load_config(&config_path)
        .with_context(|| format!("failed to load configuration from {config_path}"))?;
    GatewayConfigValidator::validate(&config).map_err(|e| eyre!("invalid configuration: {e}"))?;

    tracing::info!(
        routes = config.routes.len(),
        upstreams = config.upstreams.len(),
        rate_limiting = config.rate_limit.enabled,
        "configuration loaded"
    );

    let config = Arc::new(config);
    let gateway =
        Arc::new(GatewayService::new(config.clone()).context("failed to build gateway service")?);
    let client: Arc<dyn UpstreamClient> =
        Arc::new(ProxyHttpClient::new().context("failed to create upstream HTTP client")?);
    let handler = Arc::new(ProxyHandler::new(gateway.clone(), client.clone()));

    let graceful_shutdown = Arc::new(GracefulShutdown::new());

    let signal_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_shutdown.run_signal_handler().await {
            tracing::error!(error = %e, "signal handler error");
        }
    });

    let sweeper_handle = if config.rate_limit.cleanup_interval > Duration::ZERO {
        Some(gateway.rate_limiter().spawn_sweeper(
            config.rate_limit.cleanup_interval,
            graceful_shutdown.token(),
        ))
    } else {
        None
    };

    let health_supervisor =
        HealthChecker::new(gateway.clone(), client.clone()).spawn(&graceful_shutdown.token());

    let metrics_handle = if config.metrics.enabled {
        let metrics_addr: SocketAddr = format!("0.0.0.0:{}", config.metrics.port)
            .parse()
            .context("failed to parse metrics address")?;
        let metrics_listener = TcpListener::bind(metrics_addr)
            .await
            .context("failed to bind metrics listener")?;

        let scrape_metrics = gateway.metrics().clone();
        let snapshot_metrics = gateway.metrics().clone();
        let metrics_app = Router::new()
            .route(
                &config.metrics.path,
                get(move || {
                    let metrics = scrape_metrics.clone();
                    async move {
                        (
                            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                            metrics.render_prometheus(),
                        )
                    }
                }),
            )
            .route(
                "/json",
                get(move || {
                    let metrics = snapshot_metrics.clone();
                    async move { axum::Json(metrics.json_snapshot()) }
                }),
            );

        tracing::info!(
            port = config.metrics.port,
            path = %config.metrics.path,
            "metrics server starting"
        );

        let mut token = graceful_shutdown.token();
        Some(tokio::spawn(async move {
            let shutdown = async move { token.wait().await };
            if let Err(e) = axum::serve(metrics_listener, metrics_app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %e, "metrics server error");
            }
        }))
    } else {
        None
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("failed to parse listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind to address")?;

    tracing::info!(%addr, "gantry API gateway starting");

    let make_route = |handler: Arc<ProxyHandler>| {
        any(
            move |ConnectInfo(client_addr): ConnectInfo<SocketAddr>, req: Request| {
                let handler = handler.clone();
                async move {
                    match handler.handle_request(req, Some(client_addr)).await {
                        Ok(response) => Ok::<Response<Body>, Infallible>(response),
                        Err(e) => {
                            tracing::error!("request handling error: {:?}", e);
                            let error_response = Response::builder()
                                .status(500)
                                .body(Body::from("Internal Server Error"))
                                .unwrap_or_else(|_| {
                                    Response::new(Body::from("Internal Server Error"))
                                });
                            Ok(error_response)
                        }
                    }
                }
            },
        )
    };

    let app = Router::new()
        .route("/{*path}", make_route(handler.clone()))
        .route("/", make_route(handler.clone()));

    let mut server_token = graceful_shutdown.token();
    let server_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { server_token.wait().await })
        .await
    });

    let mut main_token = graceful_shutdown.token();
    main_token.wait().await;

    tracing::info!("shutting down, draining in-flight requests");
    match tokio::time::timeout(config.server.shutdown_timeout, server_task).await {
        Ok(Ok(Ok(()))) => tracing::info!("server drained cleanly"),
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => tracing::error!(error = %e, "server task failed"),
        Err(_) => tracing::warn!(
            timeout = ?config.server.shutdown_timeout,
            "drain deadline exceeded, abandoning remaining connections"
        ),
    }

    health_supervisor.shutdown().await;
    if let Some(handle) = sweeper_handle {
        let _ = handle.await;
    }

    // The metrics endpoint stays reachable until its own shutdown completes.
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("server gracefully stopped");
    Ok(())
}

/// Validate a configuration file and exit.
fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path) {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration summary:");
            println!(
                "   • Listen address: {}:{}",
                config.server.host, config.server.port
            );
            println!("   • Routes: {}", config.routes.len());
            println!("   • Upstreams: {}", config.upstreams.len());
            println!("   • Rate limiting: {}", config.rate_limit.enabled);
            println!(
                "   • Metrics: {} (port {})",
                config.metrics.enabled, config.metrics.port
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure all target URLs start with http:// or https://");
            println!("   • Check that every route references a defined upstream");
            println!("   • Verify the server port is in range 1..=65535");
            std::process::exit(1);
        }
    }
}
