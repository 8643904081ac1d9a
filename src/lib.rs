//! # Intent Gateway - Core Library Crate
//!
//! Control plane of the intent platform's API gateway: every external request is matched to
//! a downstream service, authenticated, rate limited, sent to a healthy instance and guarded
//! by a per-service circuit breaker.
//!
//! ## Module Map
//!
//! - [`core`]: errors, configuration, shared types and the circuit breaker state machine
//! - [`discovery`]: the service registry and its background health checking
//! - [`middleware`]: the sliding-window rate limiter and its Redis / in-memory stores
//! - [`auth`]: bearer token extraction, the authenticator seam and JWT validation
//! - [`routing`]: the longest-prefix route table
//! - [`gateway`]: the proxy pipeline and the gateway/admin HTTP servers
//! - [`observability`]: logging and Prometheus metrics setup
//!
//! ## Rust Module System Notes
//!
//! - `pub mod name;` declares a module; its code lives in `name.rs` or `name/mod.rs`
//! - `pub use` re-exports items so callers can write `intent_gateway::GatewayError`
//!   instead of the full `intent_gateway::core::error::GatewayError` path

/// Error types, configuration, shared data structures and the circuit breaker
pub mod core;

/// Service registry and health checking
pub mod discovery;

/// Distributed sliding-window rate limiting
pub mod middleware;

/// Authentication and scope authorization
pub mod auth;

/// Request routing by longest path prefix
pub mod routing;

/// Proxy pipeline and HTTP servers
pub mod gateway;

/// Logging and metrics
pub mod observability;

/// Main error type used throughout the gateway
pub use crate::core::error::{GatewayError, GatewayResult};

/// Configuration loaded by the binary
pub use crate::core::config::GatewayConfig;

pub use crate::core::circuit_breaker::{
    BreakerPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
pub use crate::core::types::{
    InstanceStatus, Principal, RegistrationRequest, RequestContext, RouteDefinition,
    ServiceDefinition, ServiceInstance,
};

pub use crate::discovery::ServiceRegistry;
pub use crate::middleware::rate_limiting::{RateLimitConfig, RateLimitResult, RateLimiter};
pub use crate::routing::router::RouteTable;

/// Primary entry points for running the gateway
pub use crate::gateway::{Gateway, GatewayServer};
