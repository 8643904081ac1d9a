//! # Intent Gateway - Main Entry Point
//!
//! Startup sequence:
//!
//! 1. load configuration (`GATEWAY_CONFIG_PATH`, default `config/gateway.yaml`), apply
//!    `GATEWAY_*` environment overrides and validate
//! 2. initialize logging and the Prometheus recorder
//! 3. build the rate limiter, registry, breakers, authenticator and route table
//! 4. register the configured service instances (health checking starts immediately)
//! 5. serve the gateway and admin listeners until SIGTERM or SIGINT
//!
//! `anyhow` is only used here, to attach context to startup failures.

use anyhow::Context;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use intent_gateway::auth::middleware::DEVELOPMENT_JWT_SECRET;
use intent_gateway::auth::JwtAuthenticator;
use intent_gateway::observability::{init_logging, install_prometheus};
use intent_gateway::{
    CircuitBreakerRegistry, Gateway, GatewayConfig, GatewayServer, RateLimiter, RouteTable,
    ServiceRegistry,
};

const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("GATEWAY_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = GatewayConfig::load_or_default(&config_path)
        .await
        .with_context(|| format!("failed to load configuration from {}", config_path))?;

    init_logging(&config.observability.logging);
    info!("🚀 Starting Intent Gateway");
    info!(version = env!("CARGO_PKG_VERSION"), config = %config_path, "Configuration loaded");

    let prometheus = if config.observability.metrics.prometheus_enabled {
        Some(install_prometheus().context("failed to install Prometheus recorder")?)
    } else {
        None
    };

    let shutdown = CancellationToken::new();
    let server = build_server(&config, prometheus, &shutdown).await?;
    info!("🌐 Gateway ready on {}", server.gateway_addr());
    info!("⚙️  Admin interface ready on {}", server.admin_addr());

    tokio::spawn(wait_for_signal(shutdown.clone()));

    if let Err(e) = server.start(shutdown).await {
        error!(error = %e, "Gateway stopped with an error");
        return Err(e.into());
    }

    info!("✅ Intent Gateway shutdown complete");
    Ok(())
}

async fn build_server(
    config: &GatewayConfig,
    prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
    shutdown: &CancellationToken,
) -> anyhow::Result<GatewayServer> {
    if config.auth.jwt.secret == DEVELOPMENT_JWT_SECRET {
        warn!("JWT secret is the development default; set GATEWAY_JWT_SECRET in production");
    }

    let client = reqwest::Client::builder()
        .connect_timeout(config.upstream.connect_timeout)
        .pool_idle_timeout(config.upstream.pool_idle_timeout)
        .pool_max_idle_per_host(config.upstream.pool_max_idle_per_host)
        .build()
        .context("failed to build upstream HTTP client")?;

    let rate_limiter = Arc::new(
        RateLimiter::from_config(config.rate_limiting.clone())
            .await
            .context("failed to initialize rate limiter")?,
    );
    rate_limiter.spawn_cleanup(config.rate_limiting.window, shutdown.child_token());

    let registry = ServiceRegistry::with_http_probe(
        client.clone(),
        config.upstream.health_check_timeout,
    );
    for registration in config.registrations() {
        let service = registration.service_name.clone();
        match registry.register(registration) {
            Ok(instance) => info!(
                service = %service,
                instance = %instance.instance_id,
                "Registered configured instance"
            ),
            Err(e) => warn!(service = %service, error = %e, "Skipping configured instance"),
        }
    }

    let routes = RouteTable::new(config.routes()).context("failed to build route table")?;
    info!(routes = routes.len(), "🛣️  Route table built");

    let breakers = CircuitBreakerRegistry::new(
        config.circuit_breaker.default.clone(),
        config.circuit_breaker.overrides.clone(),
    );

    let gateway = Gateway::new(
        Arc::new(routes),
        Arc::new(registry),
        Arc::new(breakers),
        rate_limiter,
        Arc::new(JwtAuthenticator::new(&config.auth.jwt)),
        config.auth.clone(),
        client,
    );

    Ok(GatewayServer::new(
        Arc::new(gateway),
        config.server.clone(),
        prometheus,
        &config.observability.metrics.endpoint_path,
    ))
}

/// Cancel `shutdown` on SIGTERM or SIGINT
async fn wait_for_signal(shutdown: CancellationToken) {
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = terminate => info!("📡 Received SIGTERM, initiating graceful shutdown"),
        _ = interrupt => info!("📡 Received SIGINT, initiating graceful shutdown"),
    }

    shutdown.cancel();
}
