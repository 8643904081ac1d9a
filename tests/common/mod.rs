//! Shared fixtures for the pipeline and end-to-end tests

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use axum::Router;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use intent_gateway::auth::{AuthSettings, Authenticator, JwtAuthenticator, JwtSettings};
use intent_gateway::gateway::gateway_app;
use intent_gateway::middleware::rate_limiting::WindowSnapshot;
use intent_gateway::middleware::{InMemoryStore, RateLimitError, RateLimitStore};
use intent_gateway::{
    CircuitBreakerConfig, CircuitBreakerRegistry, Gateway, GatewayResult, InstanceStatus,
    Principal, RateLimitConfig, RateLimiter, RegistrationRequest, RouteDefinition, RouteTable,
    ServiceRegistry,
};

pub const JWT_SECRET: &str = "pipeline-test-secret";

/// Authenticator that counts calls before delegating to JWT validation
pub struct CountingAuthenticator {
    pub calls: AtomicUsize,
    inner: JwtAuthenticator,
}

#[async_trait]
impl Authenticator for CountingAuthenticator {
    async fn authenticate(&self, token: &str) -> GatewayResult<Principal> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.authenticate(token).await
    }
}

/// In-memory store that counts recorded requests
#[derive(Default)]
pub struct CountingStore {
    pub records: AtomicUsize,
    inner: InMemoryStore,
}

#[async_trait]
impl RateLimitStore for CountingStore {
    async fn record(
        &self,
        key: &str,
        member: &str,
        now_ms: u64,
        window: Duration,
    ) -> Result<WindowSnapshot, RateLimitError> {
        self.records.fetch_add(1, Ordering::SeqCst);
        self.inner.record(key, member, now_ms, window).await
    }

    async fn forget(&self, key: &str, member: &str) -> Result<(), RateLimitError> {
        self.inner.forget(key, member).await
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        self.inner.reset(key).await
    }
}

pub struct Harness {
    pub gateway: Arc<Gateway>,
    pub app: Router,
    pub authenticator: Arc<CountingAuthenticator>,
    pub store: Arc<CountingStore>,
    pub issuer: JwtAuthenticator,
}

pub struct HarnessOptions {
    pub routes: Vec<RouteDefinition>,
    pub max_requests: u32,
    pub breaker: CircuitBreakerConfig,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            max_requests: 100,
            breaker: CircuitBreakerConfig {
                failure_threshold: 2,
                min_throughput: 2,
                recovery_timeout: Duration::from_secs(30),
                ..CircuitBreakerConfig::default()
            },
        }
    }
}

impl Harness {
    pub fn new(options: HarnessOptions) -> Self {
        let jwt = JwtSettings {
            secret: JWT_SECRET.to_string(),
            issuer: None,
            leeway_seconds: 0,
        };
        let authenticator = Arc::new(CountingAuthenticator {
            calls: AtomicUsize::new(0),
            inner: JwtAuthenticator::new(&jwt),
        });
        let store = Arc::new(CountingStore::default());
        let limiter = RateLimiter::new(
            RateLimitConfig {
                max_requests: options.max_requests,
                ..RateLimitConfig::default()
            },
            store.clone(),
        );
        let client = reqwest::Client::new();

        let gateway = Arc::new(Gateway::new(
            Arc::new(RouteTable::new(options.routes).expect("valid routes")),
            Arc::new(ServiceRegistry::with_http_probe(
                client.clone(),
                Duration::from_millis(500),
            )),
            Arc::new(CircuitBreakerRegistry::new(options.breaker, HashMap::new())),
            Arc::new(limiter),
            authenticator.clone(),
            AuthSettings {
                jwt: jwt.clone(),
                ..AuthSettings::default()
            },
            client,
        ));

        Self {
            app: gateway_app(gateway.clone(), 1024 * 1024),
            gateway,
            authenticator,
            store,
            issuer: JwtAuthenticator::new(&jwt),
        }
    }

    pub fn token(&self, subject: &str, scopes: &[&str]) -> String {
        self.issuer
            .issue(subject, scopes.iter().copied(), Duration::from_secs(300))
            .expect("token")
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.app.clone().oneshot(request).await.expect("infallible")
    }

    /// Register `server` for `service` and wait until it is routable
    pub async fn register_healthy(&self, service: &str, server: &MockServer) {
        let addr = server.address();
        let registration = RegistrationRequest::new(service, addr.ip().to_string(), addr.port())
            .with_check("/health", 1);
        let instance = self
            .gateway
            .registry()
            .register(registration)
            .expect("registration");

        for _ in 0..40 {
            let status = self
                .gateway
                .registry()
                .get_service(service)
                .ok()
                .and_then(|s| s.instances.get(&instance.instance_id).map(|i| i.status));
            if status == Some(InstanceStatus::Healthy) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("instance for {} never became healthy", service);
    }
}

/// Mock backend whose health endpoint answers 200
pub async fn healthy_backend() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

/// Requests the backend received other than health probes
pub async fn proxied_requests(server: &MockServer) -> Vec<wiremock::Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() != "/health")
        .collect()
}

pub async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).expect("request")
}

pub fn get_with_token(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {}", token))
        .body(Body::empty())
        .expect("request")
}
