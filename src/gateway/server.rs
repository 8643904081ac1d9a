//! # HTTP Server Module
//!
//! Two axum applications on two listeners:
//!
//! - the **gateway app** answers `GET /health` locally and hands every other request to
//!   [`Gateway::handle`] through a fallback handler
//! - the **admin app** exposes registry, breaker, route and rate-limit state plus the
//!   Prometheus scrape endpoint
//!
//! Both are served with connect info so the proxy can see the peer address, and both stop
//! on the same [`CancellationToken`].

use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::core::config::ServerConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{RegistrationRequest, RouteDefinition};
use crate::gateway::proxy::Gateway;

/// Paths served by [`admin_app`] besides the metrics endpoint; keep in step with it
pub const ADMIN_PATHS: &[&str] = &[
    "/health",
    "/services",
    "/services/:name",
    "/services/:name/instances/:instance_id",
    "/circuit-breakers",
    "/circuit-breakers/:name/reset",
    "/routes",
    "/rate-limits/stats",
];

/// Whether `path` would collide with an admin route
///
/// Anything below a path with a parameter segment is treated as a collision.
pub fn conflicts_with_admin_routes(path: &str) -> bool {
    let path = path.trim_end_matches('/');
    ADMIN_PATHS.iter().any(|admin| {
        if *admin == path {
            return true;
        }
        match admin.find("/:") {
            Some(idx) => path.starts_with(&admin[..idx + 1]),
            None => false,
        }
    })
}

/// Shared state of the admin app
#[derive(Clone)]
pub struct AdminState {
    pub gateway: Arc<Gateway>,
    pub prometheus: Option<PrometheusHandle>,
}

/// Build the public gateway app
pub fn gateway_app(gateway: Arc<Gateway>, max_request_size: usize) -> Router {
    Router::new()
        .route("/health", get(gateway_health_check))
        .fallback(proxy_handler)
        .with_state(gateway)
        .layer(RequestBodyLimitLayer::new(max_request_size))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// Build the admin app; `metrics_path` serves the Prometheus handle when one is installed
pub fn admin_app(state: AdminState, metrics_path: &str) -> Router {
    Router::new()
        .route("/health", get(admin_health_check))
        .route("/services", get(list_services).post(register_service))
        .route("/services/:name", get(get_service))
        .route(
            "/services/:name/instances/:instance_id",
            delete(deregister_instance),
        )
        .route("/circuit-breakers", get(list_circuit_breakers))
        .route("/circuit-breakers/:name/reset", post(reset_circuit_breaker))
        .route("/routes", get(list_routes))
        .route("/rate-limits/stats", get(rate_limit_stats))
        .route(metrics_path, get(render_metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Gateway and admin servers bound to their configured ports
pub struct GatewayServer {
    gateway: Arc<Gateway>,
    config: ServerConfig,
    gateway_app: Router,
    admin_app: Router,
}

impl GatewayServer {
    pub fn new(
        gateway: Arc<Gateway>,
        config: ServerConfig,
        prometheus: Option<PrometheusHandle>,
        metrics_path: &str,
    ) -> Self {
        let gateway_app = gateway_app(gateway.clone(), config.max_request_size);
        let admin_app = admin_app(
            AdminState {
                gateway: gateway.clone(),
                prometheus,
            },
            metrics_path,
        );
        Self {
            gateway,
            config,
            gateway_app,
            admin_app,
        }
    }

    pub fn gateway_addr(&self) -> String {
        format!("{}:{}", self.config.bind_address, self.config.http_port)
    }

    pub fn admin_addr(&self) -> String {
        format!("{}:{}", self.config.bind_address, self.config.admin_port)
    }

    /// Serve both apps until `shutdown` is cancelled, then drain and stop health checking
    pub async fn start(self, shutdown: CancellationToken) -> GatewayResult<()> {
        let gateway_addr = self.gateway_addr();
        let admin_addr = self.admin_addr();

        let gateway_listener = TcpListener::bind(&gateway_addr).await.map_err(|e| {
            GatewayError::internal(format!(
                "Failed to bind gateway server to {}: {}",
                gateway_addr, e
            ))
        })?;
        let admin_listener = TcpListener::bind(&admin_addr).await.map_err(|e| {
            GatewayError::internal(format!(
                "Failed to bind admin server to {}: {}",
                admin_addr, e
            ))
        })?;

        info!(address = %gateway_addr, "Gateway HTTP server listening");
        info!(address = %admin_addr, "Admin HTTP server listening");

        let gateway_task = tokio::spawn(serve(
            "gateway",
            gateway_listener,
            self.gateway_app,
            shutdown.clone(),
        ));
        let admin_task = tokio::spawn(serve(
            "admin",
            admin_listener,
            self.admin_app,
            shutdown.clone(),
        ));
        let gateway_abort = gateway_task.abort_handle();
        let admin_abort = admin_task.abort_handle();

        shutdown.cancelled().await;
        info!(
            timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
            "Waiting for in-flight requests to complete"
        );

        let mut outcome = Ok(());
        match tokio::time::timeout(self.config.shutdown_timeout, async {
            tokio::join!(gateway_task, admin_task)
        })
        .await
        {
            Ok((gateway_result, admin_result)) => {
                for result in [gateway_result, admin_result] {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => outcome = Err(e),
                        Err(e) => {
                            outcome = Err(GatewayError::internal(format!(
                                "Server task failed: {}",
                                e
                            )))
                        }
                    }
                }
            }
            Err(_) => {
                warn!("Shutdown timed out, closing remaining connections");
                gateway_abort.abort();
                admin_abort.abort();
            }
        }

        self.gateway.registry().shutdown().await;
        info!("Servers stopped");
        outcome
    }
}

async fn serve(
    name: &'static str,
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> GatewayResult<()> {
    let signal = shutdown.clone();
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { signal.cancelled().await })
    .await;

    if let Err(e) = result {
        error!(server = name, error = %e, "Server failed");
        // take the other listener down with this one
        shutdown.cancel();
        return Err(GatewayError::internal(format!("{} server error: {}", name, e)));
    }
    Ok(())
}

async fn proxy_handler(State(gateway): State<Arc<Gateway>>, request: Request) -> Response {
    gateway.handle(request).await
}

async fn gateway_health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn admin_health_check(State(state): State<AdminState>) -> impl IntoResponse {
    let stats = state.gateway.registry().stats();
    let status = if stats.services > 0 && stats.healthy_instances == 0 {
        "degraded"
    } else {
        "healthy"
    };
    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "registry": stats,
    }))
}

async fn list_services(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.gateway.registry().get_services())
}

async fn get_service(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    Ok(Json(state.gateway.registry().get_service(&name)?))
}

async fn register_service(
    State(state): State<AdminState>,
    Json(request): Json<RegistrationRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let instance = state.gateway.registry().register(request)?;
    Ok((StatusCode::CREATED, Json(instance)))
}

async fn deregister_instance(
    State(state): State<AdminState>,
    Path((name, instance_id)): Path<(String, String)>,
) -> Result<StatusCode, GatewayError> {
    state.gateway.registry().deregister(&name, &instance_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_circuit_breakers(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.gateway.breakers().snapshot_all())
}

async fn reset_circuit_breaker(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let breakers = state.gateway.breakers();
    if !breakers.reset(&name) {
        return Err(GatewayError::not_found(format!(
            "Circuit breaker '{}'",
            name
        )));
    }
    info!(service = %name, "Circuit breaker reset via admin API");
    let snapshot = breakers.get(&name).map(|b| b.snapshot());
    Ok(Json(snapshot))
}

async fn list_routes(State(state): State<AdminState>) -> Response {
    let routes: Vec<&RouteDefinition> = state
        .gateway
        .routes()
        .routes()
        .iter()
        .map(AsRef::as_ref)
        .collect();
    Json(routes).into_response()
}

async fn rate_limit_stats(State(state): State<AdminState>) -> impl IntoResponse {
    let limiter = state.gateway.rate_limiter();
    let config = limiter.config();
    Json(json!({
        "enabled": config.enabled,
        "limit": config.effective_limit(),
        "window_seconds": config.window.as_secs(),
        "redis_configured": config.redis_url.is_some(),
        "decisions": limiter.metrics().snapshot(),
    }))
}

async fn render_metrics(State(state): State<AdminState>) -> Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => GatewayError::not_found("Metrics exporter").into_response(),
    }
}
