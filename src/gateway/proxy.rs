//! # Request Proxy
//!
//! [`Gateway`] composes the route table, authenticator, rate limiter, registry and circuit
//! breakers into the per-request pipeline:
//!
//! 1. resolve the route (longest prefix + method), else 404
//! 2. authenticate and check scopes when the route requires auth, else 401/403
//! 3. consult the rate limiter when the route is rate limited, else 429
//! 4. pick a healthy instance, else 503
//! 5. forward through the service's breaker, else 503 `CIRCUIT_OPEN`
//! 6. stream the upstream response back with `X-Request-ID` and rate-limit headers
//!
//! Each stage runs only when the previous one passed. Bodies are streamed in both
//! directions, never buffered. Dropping the handler future (client disconnect) drops the
//! outbound request and the breaker permit, which releases a probe slot without counting
//! a failure.

use axum::body::{Body, HttpBody};
use axum::extract::{ConnectInfo, Request};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn, Span};

use crate::auth::middleware::{authenticate_request, AuthSettings};
use crate::auth::providers::Authenticator;
use crate::core::circuit_breaker::CircuitBreakerRegistry;
use crate::core::error::{GatewayError, GatewayResult, REQUEST_ID_HEADER};
use crate::core::types::{RequestContext, RouteDefinition, ServiceInstance};
use crate::discovery::registry::ServiceRegistry;
use crate::middleware::rate_limiting::{RateLimitResult, RateLimiter};
use crate::observability::metrics::record_request;
use crate::routing::router::RouteTable;

/// Headers that describe a single transport hop and are never forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The request pipeline and the components it composes
pub struct Gateway {
    routes: Arc<RouteTable>,
    registry: Arc<ServiceRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    rate_limiter: Arc<RateLimiter>,
    authenticator: Arc<dyn Authenticator>,
    auth_settings: AuthSettings,
    client: reqwest::Client,
}

impl Gateway {
    pub fn new(
        routes: Arc<RouteTable>,
        registry: Arc<ServiceRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        rate_limiter: Arc<RateLimiter>,
        authenticator: Arc<dyn Authenticator>,
        auth_settings: AuthSettings,
        client: reqwest::Client,
    ) -> Self {
        Self {
            routes,
            registry,
            breakers,
            rate_limiter,
            authenticator,
            auth_settings,
            client,
        }
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Run one inbound request through the pipeline; never fails
    #[instrument(
        name = "gateway_request",
        skip(self, request),
        fields(request_id = tracing::field::Empty, method = %request.method(), path = %request.uri().path())
    )]
    pub async fn handle(&self, request: Request) -> Response {
        let mut ctx = context_from_request(&request);
        Span::current().record("request_id", ctx.request_id.as_str());

        let mut response = match self.process(&mut ctx, request).await {
            Ok(response) => response,
            Err(err) => {
                if err.is_internal() {
                    warn!(
                        request_id = %ctx.request_id,
                        service = ctx.service_name().unwrap_or("-"),
                        instance = ctx.instance.as_ref().map(|i| i.instance_id.as_str()).unwrap_or("-"),
                        error = %err,
                        "Request failed"
                    );
                } else {
                    debug!(request_id = %ctx.request_id, error = %err, "Request rejected");
                }
                err.into_http_response(&ctx.request_id)
            }
        };

        if !response.headers().contains_key(REQUEST_ID_HEADER) {
            if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
                response.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
        }

        let route_label = ctx
            .route
            .as_deref()
            .map(|r| r.path_prefix.as_str())
            .unwrap_or("unmatched");
        let elapsed = ctx.elapsed();
        record_request(route_label, response.status().as_u16(), elapsed);

        info!(
            request_id = %ctx.request_id,
            route = route_label,
            service = ctx.service_name().unwrap_or("-"),
            instance = ctx.instance.as_ref().map(|i| i.instance_id.as_str()).unwrap_or("-"),
            status = response.status().as_u16(),
            latency_ms = elapsed.as_millis() as u64,
            "Request completed"
        );

        response
    }

    async fn process(&self, ctx: &mut RequestContext, request: Request) -> GatewayResult<Response> {
        let matched = self
            .routes
            .match_route(&ctx.method, &ctx.path)
            .ok_or_else(|| GatewayError::RouteNotFound {
                method: ctx.method.to_string(),
                path: ctx.path.clone(),
            })?;
        let route = matched.route.clone();
        ctx.route = Some(route.clone());

        if route.auth_required {
            let principal = authenticate_request(
                self.authenticator.as_ref(),
                &self.auth_settings,
                request.headers(),
                &route,
            )
            .await?;
            ctx.principal = Some(principal);
        }

        let rate_limit = if route.rate_limit_enabled && self.rate_limiter.config().enabled {
            let decision = self
                .rate_limiter
                .check_rate_limit(&ctx.client_id(), &route.path_prefix)
                .await;
            if !decision.allowed {
                return Err(GatewayError::RateLimited {
                    limit: decision.limit,
                    remaining: decision.remaining,
                    reset_at: decision.reset_epoch_secs(),
                    retry_after: decision.retry_after.unwrap_or_default(),
                });
            }
            Some(decision)
        } else {
            None
        };

        let instance = self.registry.get_healthy_instance(&route.service_name)?;
        ctx.instance = Some(instance.clone());

        let breaker = route
            .circuit_breaker_enabled
            .then(|| self.breakers.get_or_create(&route.service_name));
        let permit = breaker.as_ref().map(|b| b.try_acquire()).transpose()?;

        let result = self
            .forward(ctx, &route, &instance, &matched.forward_path, request)
            .await;

        if let Some(permit) = permit {
            let failed = match &result {
                Ok(response) => response.status().is_server_error(),
                Err(err) => err.should_trigger_circuit_breaker(),
            };
            permit.record(failed);
        }

        let mut response = result?;
        if let Some(decision) = rate_limit {
            apply_rate_limit_headers(response.headers_mut(), &decision);
        }
        Ok(response)
    }

    /// Send the request to `instance` and stream its response back
    async fn forward(
        &self,
        ctx: &RequestContext,
        route: &RouteDefinition,
        instance: &ServiceInstance,
        forward_path: &str,
        request: Request,
    ) -> GatewayResult<Response> {
        let url = match &ctx.query {
            Some(query) => format!("{}{}?{}", instance.base_url(), forward_path, query),
            None => format!("{}{}", instance.base_url(), forward_path),
        };
        let method = reqwest::Method::from_bytes(ctx.method.as_str().as_bytes())
            .map_err(|e| GatewayError::validation("method", e.to_string()))?;

        let (parts, body) = request.into_parts();
        let mut builder = self.client.request(method, &url);

        for (name, value) in forwardable_headers(&parts.headers) {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        builder = builder
            .header(REQUEST_ID_HEADER, ctx.request_id.as_str())
            .header("x-forwarded-for", forwarded_for(&parts.headers, ctx.remote_addr))
            .header("x-forwarded-proto", "http");
        if let Some(host) = parts.headers.get(header::HOST) {
            builder = builder.header("x-forwarded-host", host.as_bytes());
        }
        if has_body(&body) {
            builder = builder.body(stream_body(body));
        }

        debug!(
            request_id = %ctx.request_id,
            service = %route.service_name,
            instance = %instance.instance_id,
            url = %url,
            "Forwarding request"
        );

        let upstream = match tokio::time::timeout(route.timeout, builder.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => {
                return Err(upstream_timeout(&route.service_name, route.timeout));
            }
            Ok(Err(e)) => {
                warn!(
                    request_id = %ctx.request_id,
                    service = %route.service_name,
                    instance = %instance.instance_id,
                    error = %e,
                    "Upstream request failed"
                );
                return Err(GatewayError::upstream(&route.service_name, e.to_string()));
            }
            Err(_) => {
                warn!(
                    request_id = %ctx.request_id,
                    service = %route.service_name,
                    instance = %instance.instance_id,
                    timeout_ms = route.timeout.as_millis() as u64,
                    "Upstream request timed out"
                );
                return Err(upstream_timeout(&route.service_name, route.timeout));
            }
        };

        translate_response(upstream)
    }
}

fn upstream_timeout(service: &str, timeout: Duration) -> GatewayError {
    GatewayError::UpstreamTimeout {
        service: service.to_string(),
        timeout_ms: timeout.as_millis() as u64,
    }
}

/// Build the request context from the inbound request's line and headers
pub fn context_from_request(request: &Request) -> RequestContext {
    let headers = request.headers();
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut ctx = RequestContext::new(
        request.method().clone(),
        request.uri().path(),
        request_id,
    );
    ctx.query = request.uri().query().map(str::to_string);
    ctx.remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    ctx
}

/// Inbound headers minus hop-by-hop headers, `Host` and anything named in `Connection`
fn forwardable_headers(headers: &HeaderMap) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
    let connection_listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    headers.iter().filter(move |(name, _)| {
        let name = name.as_str();
        name != "host"
            && name != REQUEST_ID_HEADER
            && name != "x-forwarded-for"
            && !HOP_BY_HOP_HEADERS.contains(&name)
            && !connection_listed.iter().any(|listed| listed == name)
    })
}

/// `X-Forwarded-For` with the peer address appended
fn forwarded_for(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let existing = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    match (existing, peer) {
        (Some(existing), Some(peer)) => format!("{}, {}", existing, peer.ip()),
        (Some(existing), None) => existing.to_string(),
        (None, Some(peer)) => peer.ip().to_string(),
        (None, None) => "unknown".to_string(),
    }
}

/// Anything but a body known to be empty is forwarded; HTTP/2 and chunked requests
/// need not declare a length
fn has_body(body: &Body) -> bool {
    !body.is_end_stream() && body.size_hint().exact() != Some(0)
}

/// Pump the inbound body into a channel so the outbound client can stream it
fn stream_body(body: Body) -> reqwest::Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    tokio::spawn(async move {
        let mut stream = body.into_data_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() || failed {
                break;
            }
        }
    });
    reqwest::Body::wrap_stream(ReceiverStream::new(rx))
}

/// Convert the upstream response into an axum response with a streaming body
fn translate_response(upstream: reqwest::Response) -> GatewayResult<Response> {
    let status = StatusCode::from_u16(upstream.status().as_u16())
        .map_err(|e| GatewayError::internal(format!("Invalid upstream status: {}", e)))?;

    let connection_listed: Vec<String> = upstream
        .headers()
        .get_all("connection")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();

    let mut headers = HeaderMap::with_capacity(upstream.headers().len());
    for (name, value) in upstream.headers() {
        let lowered = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&lowered) || connection_listed.iter().any(|c| c == lowered) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitResult) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert(
        "x-ratelimit-reset",
        HeaderValue::from(decision.reset_epoch_secs()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-debug"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-debug", HeaderValue::from_static("1"));
        headers.insert("host", HeaderValue::from_static("gateway"));
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let names: Vec<&str> = forwardable_headers(&headers)
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"authorization"));
        assert!(names.contains(&"content-type"));
    }

    #[test]
    fn test_forwarded_for_appends_peer() {
        let mut headers = HeaderMap::new();
        let peer: SocketAddr = "10.0.0.9:5000".parse().unwrap();
        assert_eq!(forwarded_for(&headers, Some(peer)), "10.0.0.9");

        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        assert_eq!(forwarded_for(&headers, Some(peer)), "1.2.3.4, 10.0.0.9");
    }

    #[test]
    fn test_body_detection() {
        assert!(!has_body(&Body::empty()));
        assert!(!has_body(&Body::from("")));
        assert!(has_body(&Body::from("hello")));

        let chunks = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from("hi"))]);
        assert!(has_body(&Body::from_stream(chunks)));
    }

    #[test]
    fn test_context_from_request() {
        let request = Request::builder()
            .uri("/api/v1/echo/ping?x=1")
            .header("x-request-id", "req-1")
            .header("x-forwarded-for", "203.0.113.5, 10.0.0.1")
            .body(Body::empty())
            .unwrap();

        let ctx = context_from_request(&request);
        assert_eq!(ctx.request_id, "req-1");
        assert_eq!(ctx.path, "/api/v1/echo/ping");
        assert_eq!(ctx.query.as_deref(), Some("x=1"));
        // the forwarded chain is client supplied and never identifies the caller
        assert_eq!(ctx.client_id(), "anonymous");

        let mut request = request;
        let peer: SocketAddr = "10.0.0.1:41000".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));
        assert_eq!(context_from_request(&request).client_id(), "ip:10.0.0.1");
    }
}
