//! # Error Handling Module
//!
//! Every failure the gateway can surface to a client is a variant of [`GatewayError`].
//! Component-local errors (breaker rejections, rate-limit denials, registry lookups,
//! authentication failures) convert into it at the router boundary, where
//! [`GatewayError::into_http_response`] renders the structured JSON body:
//!
//! ```json
//! { "error": { "code": "CIRCUIT_OPEN", "message": "...", "details": { ... } }, "request_id": "..." }
//! ```
//!
//! ## Rust Error Handling Concepts
//!
//! - `thiserror` derives `Display` and `std::error::Error` from the `#[error("...")]` attributes
//! - `From` impls let the `?` operator convert library errors (I/O, serde, reqwest) automatically
//! - Matching on the enum in `status_code()` and `code()` means the compiler flags any new
//!   variant that lacks an HTTP mapping

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Header carrying the per-request correlation id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Comprehensive error types for the gateway
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Missing, malformed or expired credentials
    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    /// Valid credentials that lack a required scope
    #[error("Authorization failed: {reason}")]
    Authorization {
        reason: String,
        required_scopes: Vec<String>,
    },

    /// Caller exceeded its request budget for the current window
    #[error("Rate limit exceeded: {limit} requests per window")]
    RateLimited {
        limit: u64,
        remaining: u64,
        /// Unix timestamp (seconds) at which the window frees up
        reset_at: u64,
        retry_after: Duration,
    },

    /// The service's circuit breaker is rejecting calls
    #[error("Circuit breaker open for service: {service}")]
    CircuitOpen { service: String, retry_after: Duration },

    /// No healthy instance is available for the service
    #[error("Service unavailable: {service} - {reason}")]
    ServiceUnavailable { service: String, reason: String },

    /// Transport failure talking to the selected instance
    #[error("Upstream error from {service}: {message}")]
    Upstream { service: String, message: String },

    /// The selected instance did not answer within the route timeout
    #[error("Upstream {service} timed out after {timeout_ms}ms")]
    UpstreamTimeout { service: String, timeout_ms: u64 },

    /// No route matches the request path and method
    #[error("No route for {method} {path}")]
    RouteNotFound { method: String, path: String },

    /// Malformed registration or request input
    #[error("Validation failed: {field} - {reason}")]
    Validation { field: String, reason: String },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, sockets)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// Admin lookup of a service, instance or breaker that does not exist
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// HTTP client construction or request building errors
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an authentication error with a custom reason
    pub fn auth<S: Into<String>>(reason: S) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    /// Create an authorization error naming the scopes the route requires
    pub fn authz<S: Into<String>>(reason: S, required_scopes: Vec<String>) -> Self {
        Self::Authorization {
            reason: reason.into(),
            required_scopes,
        }
    }

    /// Create a service unavailable error
    pub fn service_unavailable<S: Into<String>, R: Into<String>>(service: S, reason: R) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Create an upstream transport error
    pub fn upstream<S: Into<String>, M: Into<String>>(service: S, message: M) -> Self {
        Self::Upstream {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a not-found error for an admin resource
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a validation error for a named field
    pub fn validation<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication { .. } => StatusCode::UNAUTHORIZED,
            Self::Authorization { .. } => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::RouteNotFound { .. } | Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::Yaml { .. }
            | Self::HttpClient { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code placed in the response body
    pub fn code(&self) -> &'static str {
        match self {
            Self::Authentication { .. } | Self::Authorization { .. } => "AUTH_ERROR",
            Self::RateLimited { .. } => "RATE_LIMIT",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            Self::Upstream { .. } | Self::UpstreamTimeout { .. } => "UPSTREAM_ERROR",
            Self::RouteNotFound { .. } => "ROUTE_NOT_FOUND",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation { .. } | Self::Json { .. } => "VALIDATION_ERROR",
            Self::Configuration { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::Yaml { .. }
            | Self::HttpClient { .. } => "INTERNAL_ERROR",
        }
    }

    /// Whether this is an unanticipated failure that must not leak its message
    pub fn is_internal(&self) -> bool {
        self.status_code() == StatusCode::INTERNAL_SERVER_ERROR
    }

    /// How long the client should wait before retrying, when known
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whether a failure of this kind indicates the upstream service is unhealthy
    pub fn should_trigger_circuit_breaker(&self) -> bool {
        matches!(self, Self::Upstream { .. } | Self::UpstreamTimeout { .. })
    }

    /// Structured, variant-specific details for the response body
    pub fn details(&self) -> Value {
        match self {
            Self::Authorization {
                required_scopes, ..
            } => json!({ "required_scopes": required_scopes }),
            Self::RateLimited {
                limit,
                remaining,
                reset_at,
                retry_after,
            } => json!({
                "limit": limit,
                "remaining": remaining,
                "reset_at": reset_at,
                "retry_after": retry_after_secs(*retry_after),
            }),
            Self::CircuitOpen {
                service,
                retry_after,
            } => json!({
                "service": service,
                "retry_after": retry_after_secs(*retry_after),
            }),
            Self::ServiceUnavailable { service, .. } => json!({ "service": service }),
            Self::Upstream { service, .. } => json!({ "service": service }),
            Self::UpstreamTimeout {
                service,
                timeout_ms,
            } => json!({ "service": service, "timeout_ms": timeout_ms }),
            Self::RouteNotFound { method, path } => json!({ "method": method, "path": path }),
            Self::Validation { field, .. } => json!({ "field": field }),
            _ => json!({}),
        }
    }

    /// Render this error as the gateway's structured JSON response
    ///
    /// Internal errors are logged with the correlation id and replaced by a generic
    /// message so implementation details never reach the client.
    pub fn into_http_response(self, request_id: &str) -> Response {
        let status = self.status_code();

        let (message, details) = if self.is_internal() {
            error!(request_id = %request_id, error = %self, "Unhandled gateway error");
            (
                "Internal server error".to_string(),
                json!({ "correlation_id": request_id }),
            )
        } else {
            (self.to_string(), self.details())
        };

        let body = json!({
            "error": {
                "code": self.code(),
                "message": message,
                "details": details,
            },
            "request_id": request_id,
        });

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();

        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(REQUEST_ID_HEADER, value);
        }
        if let Some(retry_after) = self.retry_after() {
            headers.insert(
                "retry-after",
                HeaderValue::from(retry_after_secs(retry_after)),
            );
        }
        if let Self::RateLimited {
            limit,
            remaining,
            reset_at,
            ..
        } = &self
        {
            headers.insert("x-ratelimit-limit", HeaderValue::from(*limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(*remaining));
            headers.insert("x-ratelimit-reset", HeaderValue::from(*reset_at));
        }
        match &self {
            Self::Authentication { .. } => {
                headers.insert("www-authenticate", HeaderValue::from_static("Bearer"));
            }
            Self::Authorization {
                required_scopes, ..
            } => {
                let challenge = format!("Bearer scope=\"{}\"", required_scopes.join(" "));
                if let Ok(value) = HeaderValue::from_str(&challenge) {
                    headers.insert("www-authenticate", value);
                }
            }
            _ => {}
        }
        if matches!(self, Self::CircuitOpen { .. }) {
            headers.insert("x-circuit-breaker", HeaderValue::from_static("open"));
        }

        response
    }
}

/// Whole seconds, rounded up so clients never retry early
fn retry_after_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpClient {
            message: err.to_string(),
        }
    }
}

/// Errors raised outside a request (admin handlers) get a fresh correlation id
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();
        self.into_http_response(&request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GatewayError::auth("invalid token").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::authz("missing scope", vec!["write".into()]).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::RateLimited {
                limit: 100,
                remaining: 0,
                reset_at: 0,
                retry_after: Duration::from_secs(1),
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::UpstreamTimeout {
                service: "echo".into(),
                timeout_ms: 30_000
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(GatewayError::auth("x").code(), "AUTH_ERROR");
        assert_eq!(
            GatewayError::CircuitOpen {
                service: "echo".into(),
                retry_after: Duration::from_secs(5)
            }
            .code(),
            "CIRCUIT_OPEN"
        );
        assert_eq!(
            GatewayError::service_unavailable("echo", "no healthy instance").code(),
            "SERVICE_UNAVAILABLE"
        );
        assert_eq!(GatewayError::upstream("echo", "refused").code(), "UPSTREAM_ERROR");
        assert_eq!(
            GatewayError::RouteNotFound {
                method: "GET".into(),
                path: "/nope".into()
            }
            .code(),
            "ROUTE_NOT_FOUND"
        );
    }

    #[test]
    fn test_circuit_breaker_triggers() {
        assert!(GatewayError::upstream("api", "reset").should_trigger_circuit_breaker());
        assert!(GatewayError::UpstreamTimeout {
            service: "api".into(),
            timeout_ms: 5000
        }
        .should_trigger_circuit_breaker());
        assert!(!GatewayError::auth("invalid").should_trigger_circuit_breaker());
        assert!(!GatewayError::service_unavailable("api", "none").should_trigger_circuit_breaker());
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_millis(1500)), 2);
        assert_eq!(retry_after_secs(Duration::from_secs(3)), 3);
    }

    #[test]
    fn test_circuit_open_response_headers() {
        let response = GatewayError::CircuitOpen {
            service: "echo".into(),
            retry_after: Duration::from_secs(30),
        }
        .into_http_response("req-1");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["retry-after"], "30");
        assert_eq!(response.headers()["x-request-id"], "req-1");
        assert_eq!(response.headers()["x-circuit-breaker"], "open");
    }

    #[test]
    fn test_internal_error_hides_message() {
        let err = GatewayError::internal("database password is hunter2");
        assert!(err.is_internal());
        let response = err.into_http_response("corr-9");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
