//! # Router Module
//!
//! Maps an inbound method and path to a [`RouteDefinition`] by longest path-prefix match.
//!
//! Prefixes match on segment boundaries only: `/api/v1/echo` matches `/api/v1/echo` and
//! `/api/v1/echo/ping`, never `/api/v1/echoes`. Among the routes whose prefix matches,
//! the longest prefix that also allows the method wins; if none allows the method the
//! request has no route.
//!
//! The table is immutable once built and shared behind an `Arc`.

use axum::http::Method;
use std::collections::HashSet;
use std::sync::Arc;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::RouteDefinition;

/// Result of a successful lookup
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<RouteDefinition>,
    /// Path to send upstream after optional prefix stripping
    pub forward_path: String,
}

/// Immutable prefix route table
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    /// Sorted by prefix length, longest first
    routes: Vec<Arc<RouteDefinition>>,
}

impl RouteTable {
    /// Build a table, rejecting invalid definitions and duplicate (prefix, method) pairs
    pub fn new(routes: Vec<RouteDefinition>) -> GatewayResult<Self> {
        let mut seen = HashSet::new();
        let mut table = Vec::with_capacity(routes.len());

        for mut route in routes {
            route.validate()?;
            route.path_prefix = normalize_prefix(&route.path_prefix);

            for method in &route.allowed_methods {
                if !seen.insert((route.path_prefix.clone(), method.clone())) {
                    return Err(GatewayError::config(format!(
                        "Duplicate route for {} {}",
                        method, route.path_prefix
                    )));
                }
            }
            table.push(Arc::new(route));
        }

        table.sort_by(|a, b| {
            b.path_prefix
                .len()
                .cmp(&a.path_prefix.len())
                .then_with(|| a.path_prefix.cmp(&b.path_prefix))
        });

        Ok(Self { routes: table })
    }

    /// Match a request to a route
    pub fn match_route(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        self.routes
            .iter()
            .find(|route| prefix_matches(&route.path_prefix, path) && route.allows_method(method))
            .map(|route| RouteMatch {
                forward_path: rewrite_path(route, path),
                route: route.clone(),
            })
    }

    /// Get all registered routes, longest prefix first
    pub fn routes(&self) -> &[Arc<RouteDefinition>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Builder for creating route tables with fluent API
#[derive(Debug, Default)]
pub struct RouteTableBuilder {
    routes: Vec<RouteDefinition>,
}

impl RouteTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, route: RouteDefinition) -> Self {
        self.routes.push(route);
        self
    }

    /// Add a GET route with default policy
    pub fn get(self, prefix: &str, service: &str) -> Self {
        self.route(RouteDefinition::new(service, prefix).methods([Method::GET]))
    }

    /// Add a POST route with default policy
    pub fn post(self, prefix: &str, service: &str) -> Self {
        self.route(RouteDefinition::new(service, prefix).methods([Method::POST]))
    }

    pub fn build(self) -> GatewayResult<RouteTable> {
        RouteTable::new(self.routes)
    }
}

pub(crate) fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Path forwarded upstream for `path` on `route`
pub fn rewrite_path(route: &RouteDefinition, path: &str) -> String {
    if !route.strip_prefix || route.path_prefix == "/" {
        return path.to_string();
    }
    match path.strip_prefix(route.path_prefix.as_str()) {
        Some("") | None => "/".to_string(),
        Some(rest) => rest.to_string(),
    }
}
