//! # Configuration Module
//!
//! Loading and validation of the gateway configuration.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde
//! - Human readable durations (`"30s"`, `"250ms"`) via humantime
//! - Environment variable override support
//! - Validation that reports every problem at once

use axum::http::Method;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::auth::middleware::AuthSettings;
use crate::core::circuit_breaker::CircuitBreakerConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{
    default_check_endpoint, default_methods, default_route_timeout, default_true, method_serde,
    RegistrationRequest, RouteDefinition,
};
use crate::gateway::server::conflicts_with_admin_routes;
use crate::middleware::rate_limiting::RateLimitConfig;
use crate::routing::router::normalize_prefix;

/// Main gateway configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration
    pub server: ServerConfig,

    /// Outbound HTTP client and health probe settings
    pub upstream: UpstreamClientConfig,

    pub rate_limiting: RateLimitConfig,

    pub auth: AuthSettings,

    pub circuit_breaker: CircuitBreakerSettings,

    /// Routed services, each with its startup instances
    pub services: Vec<ServiceSpec>,

    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: GatewayConfig = serde_yaml::from_str(&content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from JSON
    pub async fn load_from_json<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: GatewayConfig = serde_json::from_str(&content)
            .map_err(|e| GatewayError::config(format!("Failed to parse JSON config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when it exists, otherwise start from the built-in defaults
    ///
    /// Environment overrides and validation apply either way.
    pub async fn load_or_default<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let is_json = path.extension().map_or(false, |ext| ext == "json");
            if is_json {
                Self::load_from_json(path).await
            } else {
                Self::load_from_file(path).await
            }
        } else {
            let mut config = Self::default();
            config.apply_env_overrides()?;
            config.validate()?;
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Environment variables follow the pattern: GATEWAY_<SECTION>_<FIELD>
    /// For example: GATEWAY_SERVER_HTTP_PORT=8080
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(addr) = env::var("GATEWAY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Ok(port) = env::var("GATEWAY_SERVER_HTTP_PORT") {
            self.server.http_port = port.parse().map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_SERVER_HTTP_PORT: {}", e))
            })?;
        }

        if let Ok(port) = env::var("GATEWAY_SERVER_ADMIN_PORT") {
            self.server.admin_port = port.parse().map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_SERVER_ADMIN_PORT: {}", e))
            })?;
        }

        if let Ok(level) = env::var("GATEWAY_LOG_LEVEL") {
            self.observability.logging.level = level;
        }

        if let Ok(format) = env::var("GATEWAY_LOG_FORMAT") {
            self.observability.logging.format = format;
        }

        if let Ok(enabled) = env::var("GATEWAY_METRICS_ENABLED") {
            self.observability.metrics.prometheus_enabled = enabled.parse().map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_METRICS_ENABLED: {}", e))
            })?;
        }

        if let Ok(url) = env::var("GATEWAY_REDIS_URL") {
            self.rate_limiting.redis_url = if url.is_empty() { None } else { Some(url) };
        }

        if let Ok(max) = env::var("GATEWAY_RATE_LIMIT_MAX_REQUESTS") {
            self.rate_limiting.max_requests = max.parse().map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_RATE_LIMIT_MAX_REQUESTS: {}", e))
            })?;
        }

        if let Ok(window) = env::var("GATEWAY_RATE_LIMIT_WINDOW") {
            self.rate_limiting.window = humantime::parse_duration(&window).map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_RATE_LIMIT_WINDOW: {}", e))
            })?;
        }

        if let Ok(secret) = env::var("GATEWAY_JWT_SECRET") {
            self.auth.jwt.secret = secret;
        }

        Ok(())
    }

    /// Comprehensive configuration validation with detailed error messages
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("http_port must be greater than 0".to_string());
        }
        if self.server.admin_port == 0 {
            errors.push("admin_port must be greater than 0".to_string());
        }
        if self.server.http_port != 0 && self.server.http_port == self.server.admin_port {
            errors.push(format!(
                "http_port and admin_port must differ (both {})",
                self.server.http_port
            ));
        }
        if self.server.bind_address.is_empty() {
            errors.push("bind_address cannot be empty".to_string());
        }
        if self.server.max_request_size == 0 {
            errors.push("max_request_size must be greater than 0".to_string());
        }

        let mut seen_routes: HashSet<(String, Method)> = HashSet::new();
        for (index, service) in self.services.iter().enumerate() {
            if service.service_name.trim().is_empty() {
                errors.push(format!("Service {} has an empty service_name", index));
            }
            if service.path_prefix.is_empty() || !service.path_prefix.starts_with('/') {
                errors.push(format!(
                    "Service '{}' path_prefix '{}' must start with '/'",
                    service.service_name, service.path_prefix
                ));
            }
            if service.methods.is_empty() {
                errors.push(format!(
                    "Service '{}' has no HTTP methods specified",
                    service.service_name
                ));
            }
            for method in &service.methods {
                if !STANDARD_METHODS.contains(method) {
                    errors.push(format!(
                        "Service '{}' has invalid HTTP method: {}",
                        service.service_name, method
                    ));
                }
                let prefix = normalize_prefix(&service.path_prefix);
                if !seen_routes.insert((prefix.clone(), method.clone())) {
                    errors.push(format!("Duplicate route: {} {}", method, prefix));
                }
            }
            if service.timeout.is_zero() {
                errors.push(format!(
                    "Service '{}' timeout must be greater than 0",
                    service.service_name
                ));
            }
            if service.check_interval.is_zero() {
                errors.push(format!(
                    "Service '{}' check_interval must be greater than 0",
                    service.service_name
                ));
            }
            for instance in &service.instances {
                if instance.host.trim().is_empty() {
                    errors.push(format!(
                        "Service '{}' has an instance with an empty host",
                        service.service_name
                    ));
                }
                if instance.port == 0 {
                    errors.push(format!(
                        "Service '{}' has an instance with port 0",
                        service.service_name
                    ));
                }
            }
        }

        let breaker_configs = std::iter::once(("default", &self.circuit_breaker.default)).chain(
            self.circuit_breaker
                .overrides
                .iter()
                .map(|(name, cfg)| (name.as_str(), cfg)),
        );
        for (name, cb) in breaker_configs {
            if cb.failure_threshold == 0 {
                errors.push(format!(
                    "Circuit breaker '{}' failure_threshold must be greater than 0",
                    name
                ));
            }
            if cb.success_threshold == 0 {
                errors.push(format!(
                    "Circuit breaker '{}' success_threshold must be greater than 0",
                    name
                ));
            }
            if cb.failure_window.is_zero() {
                errors.push(format!(
                    "Circuit breaker '{}' failure_window must be greater than 0",
                    name
                ));
            }
        }

        if self.rate_limiting.max_requests == 0 {
            errors.push("rate_limiting.max_requests must be greater than 0".to_string());
        }
        if self.rate_limiting.window.is_zero() {
            errors.push("rate_limiting.window must be greater than 0".to_string());
        }
        if !(self.rate_limiting.burst_multiplier >= 1.0) {
            errors.push(format!(
                "rate_limiting.burst_multiplier must be at least 1.0, got: {}",
                self.rate_limiting.burst_multiplier
            ));
        }

        if self.services.iter().any(|s| s.auth_required) && self.auth.jwt.secret.is_empty() {
            errors.push("JWT secret cannot be empty when a service requires auth".to_string());
        }

        match self.observability.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => errors.push(format!(
                "Invalid log level: {}",
                self.observability.logging.level
            )),
        }

        let metrics_path = &self.observability.metrics.endpoint_path;
        if !metrics_path.starts_with('/') {
            errors.push(format!(
                "metrics.endpoint_path '{}' must start with '/'",
                metrics_path
            ));
        } else if metrics_path.contains(|c: char| c == ':' || c == '*') {
            errors.push(format!(
                "metrics.endpoint_path '{}' cannot contain path parameters",
                metrics_path
            ));
        } else if conflicts_with_admin_routes(metrics_path) {
            errors.push(format!(
                "metrics.endpoint_path '{}' collides with an admin route",
                metrics_path
            ));
        }

        match self.observability.logging.format.to_lowercase().as_str() {
            "json" | "text" => {}
            _ => errors.push(format!(
                "Invalid log format: {}",
                self.observability.logging.format
            )),
        }

        if !errors.is_empty() {
            return Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }

    /// Route table entries, one per configured service
    pub fn routes(&self) -> Vec<RouteDefinition> {
        self.services.iter().map(ServiceSpec::route).collect()
    }

    /// Registrations for every statically configured instance
    pub fn registrations(&self) -> Vec<RegistrationRequest> {
        self.services
            .iter()
            .flat_map(ServiceSpec::registrations)
            .collect()
    }
}

const STANDARD_METHODS: [Method; 7] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::HEAD,
    Method::OPTIONS,
];

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for both listeners
    pub bind_address: String,

    /// Gateway (proxy) port
    pub http_port: u16,

    /// Admin API and metrics port
    pub admin_port: u16,

    /// Maximum inbound body size in bytes
    pub max_request_size: usize,

    /// Time allowed for in-flight requests after a shutdown signal
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8080,
            admin_port: 9080,
            max_request_size: 10 * 1024 * 1024,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Outbound HTTP client settings shared by the proxy and health probes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamClientConfig {
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Bound on one health probe request
    #[serde(with = "humantime_serde")]
    pub health_check_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub pool_idle_timeout: Duration,

    pub pool_max_idle_per_host: usize,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(5),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 32,
        }
    }
}

/// Breaker configuration with per-service overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub default: CircuitBreakerConfig,
    pub overrides: HashMap<String, CircuitBreakerConfig>,
}

/// Host/port of a statically configured instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAddress {
    pub host: String,
    pub port: u16,
}

/// A routed service: its route policy plus the instances registered at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub service_name: String,
    pub path_prefix: String,

    #[serde(with = "method_serde", default = "default_methods")]
    pub methods: Vec<Method>,

    #[serde(default)]
    pub instances: Vec<InstanceAddress>,

    #[serde(default = "default_check_endpoint")]
    pub check_endpoint: String,

    #[serde(with = "humantime_serde", default = "default_check_period")]
    pub check_interval: Duration,

    #[serde(default = "default_true")]
    pub strip_prefix: bool,

    #[serde(with = "humantime_serde", default = "default_route_timeout")]
    pub timeout: Duration,

    #[serde(default = "default_true")]
    pub circuit_breaker: bool,

    #[serde(default = "default_true")]
    pub rate_limit: bool,

    #[serde(default = "default_true")]
    pub auth_required: bool,

    #[serde(default)]
    pub scopes: BTreeSet<String>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_check_period() -> Duration {
    Duration::from_secs(30)
}

impl ServiceSpec {
    pub fn new(service_name: impl Into<String>, path_prefix: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            path_prefix: path_prefix.into(),
            methods: default_methods(),
            instances: Vec::new(),
            check_endpoint: default_check_endpoint(),
            check_interval: default_check_period(),
            strip_prefix: true,
            timeout: default_route_timeout(),
            circuit_breaker: true,
            rate_limit: true,
            auth_required: true,
            scopes: BTreeSet::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn route(&self) -> RouteDefinition {
        RouteDefinition::new(&self.service_name, &self.path_prefix)
            .methods(self.methods.iter().cloned())
            .strip_prefix(self.strip_prefix)
            .timeout(self.timeout)
            .circuit_breaker(self.circuit_breaker)
            .rate_limit(self.rate_limit)
            .auth(self.auth_required)
            .scopes(self.scopes.iter().cloned())
    }

    pub fn registrations(&self) -> Vec<RegistrationRequest> {
        let interval = self.check_interval.as_secs().max(1);
        self.instances
            .iter()
            .map(|instance| {
                let mut request =
                    RegistrationRequest::new(&self.service_name, &instance.host, instance.port)
                        .with_check(&self.check_endpoint, interval);
                request.metadata = self.metadata.clone();
                request
            })
            .collect()
    }
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,

    /// Log format (json, text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics
    pub prometheus_enabled: bool,

    /// Metrics endpoint path on the admin listener
    pub endpoint_path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prometheus_enabled: true,
            endpoint_path: "/metrics".to_string(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let context = ServiceSpec {
            methods: vec![Method::GET, Method::POST],
            scopes: ["read", "write"].iter().map(|s| s.to_string()).collect(),
            instances: vec![local_instance(8001)],
            ..ServiceSpec::new("context_service", "/api/v1/context")
        };
        let intent = ServiceSpec {
            instances: vec![local_instance(8002)],
            ..ServiceSpec::new("intent_service", "/api/v1/intent")
        };
        let prediction = ServiceSpec {
            scopes: std::iter::once("read".to_string()).collect(),
            instances: vec![local_instance(8003)],
            ..ServiceSpec::new("prediction_service", "/api/v1/predict")
        };
        let realtime = ServiceSpec {
            check_interval: Duration::from_secs(15),
            circuit_breaker: false,
            instances: vec![local_instance(8004)],
            ..ServiceSpec::new("realtime_service", "/api/v1/realtime")
        };

        Self {
            server: ServerConfig::default(),
            upstream: UpstreamClientConfig::default(),
            rate_limiting: RateLimitConfig::default(),
            auth: AuthSettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            services: vec![context, intent, prediction, realtime],
            observability: ObservabilityConfig::default(),
        }
    }
}

fn local_instance(port: u16) -> InstanceAddress {
    InstanceAddress {
        host: "localhost".to_string(),
        port,
    }
}
