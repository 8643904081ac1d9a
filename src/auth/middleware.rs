//! # Authentication Middleware
//!
//! Token extraction, the bounded authenticator call and the scope check the proxy runs
//! for routes with `auth_required`.

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::auth::providers::Authenticator;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{Principal, RouteDefinition};

/// Secret used when nothing is configured; startup warns when it is still in place
pub const DEVELOPMENT_JWT_SECRET: &str = "development-secret-change-me";

/// JWT verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtSettings {
    /// HS256 shared secret
    pub secret: String,
    /// Expected `iss` claim, when set
    pub issuer: Option<String>,
    /// Clock skew tolerated on `exp`
    pub leeway_seconds: u64,
}

impl Default for JwtSettings {
    fn default() -> Self {
        Self {
            secret: DEVELOPMENT_JWT_SECRET.to_string(),
            issuer: None,
            leeway_seconds: 30,
        }
    }
}

/// Authentication middleware configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Header name to extract the token from
    pub token_header: String,
    /// Token prefix to strip (e.g., "Bearer ")
    pub token_prefix: String,
    /// Bound on one authenticator call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub jwt: JwtSettings,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            token_header: "authorization".to_string(),
            token_prefix: "Bearer ".to_string(),
            timeout: Duration::from_secs(2),
            jwt: JwtSettings::default(),
        }
    }
}

/// Extract token from request headers
///
/// The prefix comparison ignores ASCII case so `bearer x` is accepted as well.
pub fn extract_token<'a>(headers: &'a HeaderMap, settings: &AuthSettings) -> Option<&'a str> {
    let value = headers
        .get(settings.token_header.as_str())
        .and_then(|value| value.to_str().ok())?
        .trim();

    let prefix = settings.token_prefix.as_str();
    if prefix.is_empty() {
        return (!value.is_empty()).then_some(value);
    }

    let head = value.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let token = value[prefix.len()..].trim();
    (!token.is_empty()).then_some(token)
}

/// Fail with 403 unless `principal` holds every scope the route requires
pub fn authorize(principal: &Principal, route: &RouteDefinition) -> GatewayResult<()> {
    let missing = principal.missing_scopes(&route.required_scopes);
    if missing.is_empty() {
        return Ok(());
    }

    debug!(
        subject = %principal.subject,
        missing = ?missing,
        route = %route.path_prefix,
        "Principal lacks required scopes"
    );
    Err(GatewayError::authz(
        format!("Missing required scopes: {}", missing.join(", ")),
        route.required_scopes.iter().cloned().collect(),
    ))
}

/// Authenticate the request and check the route's scopes
pub async fn authenticate_request(
    authenticator: &dyn Authenticator,
    settings: &AuthSettings,
    headers: &HeaderMap,
    route: &RouteDefinition,
) -> GatewayResult<Principal> {
    let token = extract_token(headers, settings)
        .ok_or_else(|| GatewayError::auth("Missing or malformed bearer token"))?;

    let principal = match timeout(settings.timeout, authenticator.authenticate(token)).await {
        Ok(result) => result?,
        Err(_) => {
            warn!(
                timeout_ms = settings.timeout.as_millis() as u64,
                route = %route.path_prefix,
                "Authenticator timed out"
            );
            return Err(GatewayError::service_unavailable(
                "authenticator",
                "authentication timed out",
            ));
        }
    };

    authorize(&principal, route)?;
    Ok(principal)
}
