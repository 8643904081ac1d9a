//! # Core Types Module
//!
//! Data structures shared by the registry, the breakers, the rate limiter and the router.
//!
//! ## Rust Ownership Concepts in This Module
//!
//! - The registry owns live instance state; everything handed out here is a cloned snapshot,
//!   so readers never hold a lock belonging to the registry
//! - `Arc<RouteDefinition>` lets every in-flight request share the immutable route table entry
//! - `serde` derives make the same types usable for YAML config and admin JSON output

use axum::http::Method;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::core::error::{GatewayError, GatewayResult};

/// Lifecycle status of a registered service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Registered, no health check has succeeded yet
    Starting,
    /// Last health check succeeded
    Healthy,
    /// Last health check failed or timed out
    Unhealthy,
    /// Explicitly removed from the registry
    Deregistered,
}

impl InstanceStatus {
    /// Only healthy instances may receive traffic
    pub fn is_routable(self) -> bool {
        matches!(self, InstanceStatus::Healthy)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Starting => write!(f, "STARTING"),
            InstanceStatus::Healthy => write!(f, "HEALTHY"),
            InstanceStatus::Unhealthy => write!(f, "UNHEALTHY"),
            InstanceStatus::Deregistered => write!(f, "DEREGISTERED"),
        }
    }
}

/// Point-in-time view of one running copy of a downstream service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// `host:port`, unique within a service
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub status: InstanceStatus,
    /// Completion time of the most recent health check
    pub last_check: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    /// Build the canonical instance id for an address
    pub fn make_id(host: &str, port: u16) -> String {
        format!("{}:{}", host, port)
    }

    /// Base URL used for forwarding and health probes
    pub fn base_url(&self) -> String {
        if self.host.contains(':') {
            // bare IPv6 literal
            format!("http://[{}]:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

/// Point-in-time view of a named service and its instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub service_name: String,
    pub check_endpoint: String,
    pub check_interval_seconds: u64,
    /// Instances keyed by instance id
    pub instances: HashMap<String, ServiceInstance>,
}

impl ServiceDefinition {
    /// Number of instances currently eligible for traffic
    pub fn healthy_count(&self) -> usize {
        self.instances
            .values()
            .filter(|i| i.status.is_routable())
            .count()
    }
}

/// Request to add (or refresh) an instance in the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_check_endpoint")]
    pub check_endpoint: String,
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RegistrationRequest {
    /// Registration with the default `/health` endpoint and 30 second interval
    pub fn new(service_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            host: host.into(),
            port,
            check_endpoint: default_check_endpoint(),
            check_interval_seconds: default_check_interval(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_check(mut self, endpoint: impl Into<String>, interval_seconds: u64) -> Self {
        self.check_endpoint = endpoint.into();
        self.check_interval_seconds = interval_seconds;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub(crate) fn default_check_endpoint() -> String {
    "/health".to_string()
}

pub(crate) fn default_check_interval() -> u64 {
    30
}

/// Static routing rule mapping a path prefix to a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDefinition {
    /// Target service in the registry
    pub service_name: String,

    /// Path prefix matched against the inbound path (longest match wins)
    pub path_prefix: String,

    /// Allowed HTTP methods (stored as strings for serialization)
    #[serde(rename = "methods", with = "method_serde", default = "default_methods")]
    pub allowed_methods: Vec<Method>,

    /// Remove `path_prefix` before forwarding
    #[serde(default = "default_true")]
    pub strip_prefix: bool,

    /// Bound on the outbound call
    #[serde(with = "humantime_serde", default = "default_route_timeout")]
    pub timeout: Duration,

    #[serde(rename = "circuit_breaker", default = "default_true")]
    pub circuit_breaker_enabled: bool,

    #[serde(rename = "rate_limit", default = "default_true")]
    pub rate_limit_enabled: bool,

    #[serde(default = "default_true")]
    pub auth_required: bool,

    /// Scopes the caller's principal must all hold
    #[serde(rename = "scopes", default)]
    pub required_scopes: BTreeSet<String>,
}

/// Custom serialization module for HTTP methods
pub(crate) mod method_serde {
    use axum::http::Method;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;

    pub fn serialize<S>(methods: &[Method], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let method_strings: Vec<&str> = methods.iter().map(|m| m.as_str()).collect();
        method_strings.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Method>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let method_strings: Vec<String> = Vec::deserialize(deserializer)?;
        method_strings
            .into_iter()
            .map(|s| Method::from_str(&s.to_uppercase()).map_err(serde::de::Error::custom))
            .collect()
    }
}

pub(crate) fn default_methods() -> Vec<Method> {
    vec![Method::GET, Method::POST, Method::PUT, Method::DELETE]
}

pub(crate) fn default_true() -> bool {
    true
}

pub(crate) fn default_route_timeout() -> Duration {
    Duration::from_secs(30)
}

impl RouteDefinition {
    /// Route with the default policy: GET/POST/PUT/DELETE, prefix stripped, 30s timeout,
    /// breaker, rate limit and auth all enabled, no required scopes
    pub fn new(service_name: impl Into<String>, path_prefix: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            path_prefix: path_prefix.into(),
            allowed_methods: default_methods(),
            strip_prefix: true,
            timeout: default_route_timeout(),
            circuit_breaker_enabled: true,
            rate_limit_enabled: true,
            auth_required: true,
            required_scopes: BTreeSet::new(),
        }
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.allowed_methods = methods.into_iter().collect();
        self
    }

    pub fn strip_prefix(mut self, strip: bool) -> Self {
        self.strip_prefix = strip;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn circuit_breaker(mut self, enabled: bool) -> Self {
        self.circuit_breaker_enabled = enabled;
        self
    }

    pub fn rate_limit(mut self, enabled: bool) -> Self {
        self.rate_limit_enabled = enabled;
        self
    }

    pub fn auth(mut self, required: bool) -> Self {
        self.auth_required = required;
        self
    }

    pub fn scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Check if this route accepts the given method
    pub fn allows_method(&self, method: &Method) -> bool {
        self.allowed_methods.contains(method)
    }

    /// Reject definitions that could never match or never forward
    pub fn validate(&self) -> GatewayResult<()> {
        if self.service_name.trim().is_empty() {
            return Err(GatewayError::validation(
                "service_name",
                format!("route '{}' has an empty service name", self.path_prefix),
            ));
        }
        if !self.path_prefix.starts_with('/') {
            return Err(GatewayError::validation(
                "path_prefix",
                format!("'{}' must start with '/'", self.path_prefix),
            ));
        }
        if self.allowed_methods.is_empty() {
            return Err(GatewayError::validation(
                "methods",
                format!("route '{}' allows no methods", self.path_prefix),
            ));
        }
        if self.timeout.is_zero() {
            return Err(GatewayError::validation(
                "timeout",
                format!("route '{}' has a zero timeout", self.path_prefix),
            ));
        }
        Ok(())
    }
}

/// Authenticated caller as reported by the authenticator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable caller identity (JWT `sub`)
    pub subject: String,
    pub scopes: BTreeSet<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Principal {
    pub fn new<I, S>(subject: impl Into<String>, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subject: subject.into(),
            scopes: scopes.into_iter().map(Into::into).collect(),
            expires_at: None,
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    /// Required scopes this principal does not hold
    pub fn missing_scopes<'a>(&self, required: &'a BTreeSet<String>) -> Vec<&'a str> {
        required
            .iter()
            .filter(|scope| !self.scopes.contains(*scope))
            .map(String::as_str)
            .collect()
    }
}

/// Per-request state carried through the proxy pipeline
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation id, taken from `X-Request-ID` or generated
    pub request_id: String,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    /// Peer address of the inbound connection
    pub remote_addr: Option<SocketAddr>,
    pub route: Option<Arc<RouteDefinition>>,
    pub principal: Option<Principal>,
    pub instance: Option<ServiceInstance>,
    pub start_time: Instant,
}

impl RequestContext {
    pub fn new(method: Method, path: impl Into<String>, request_id: Option<String>) -> Self {
        Self {
            request_id: request_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            method,
            path: path.into(),
            query: None,
            remote_addr: None,
            route: None,
            principal: None,
            instance: None,
            start_time: Instant::now(),
        }
    }

    /// Identity used for rate limiting: principal, then peer ip
    ///
    /// `X-Forwarded-For` is client supplied and never consulted.
    pub fn client_id(&self) -> String {
        if let Some(principal) = &self.principal {
            return format!("user:{}", principal.subject);
        }
        match self.remote_addr {
            Some(addr) => format!("ip:{}", addr.ip()),
            None => "anonymous".to_string(),
        }
    }

    /// Get elapsed time since request started
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn service_name(&self) -> Option<&str> {
        self.route.as_deref().map(|r| r.service_name.as_str())
    }
}
