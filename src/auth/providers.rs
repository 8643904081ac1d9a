//! # Authentication Providers
//!
//! The gateway only needs one thing from an authenticator: turn a bearer token into a
//! [`Principal`] (subject plus scope set) or fail. [`JwtAuthenticator`] does that for
//! HS256 tokens carrying `sub`, `scopes` and `exp` claims.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::auth::middleware::JwtSettings;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::Principal;

/// Resolves credentials into a principal
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Validate `token`; fails with `GatewayError::Authentication` when it is not acceptable
    async fn authenticate(&self, token: &str) -> GatewayResult<Principal>;
}

/// Claims carried by gateway access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// HS256 JWT validation
pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    validation: Validation,
    issuer: Option<String>,
}

impl JwtAuthenticator {
    pub fn new(settings: &JwtSettings) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = settings.leeway_seconds;
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(issuer) = &settings.issuer {
            validation.set_issuer(&[issuer.as_str()]);
        }

        Self {
            decoding_key: DecodingKey::from_secret(settings.secret.as_bytes()),
            encoding_key: EncodingKey::from_secret(settings.secret.as_bytes()),
            validation,
            issuer: settings.issuer.clone(),
        }
    }

    /// Sign a token for `subject` valid for `ttl`
    pub fn issue<I, S>(&self, subject: &str, scopes: I, ttl: Duration) -> GatewayResult<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let claims = Claims {
            sub: subject.to_string(),
            scopes: scopes.into_iter().map(Into::into).collect(),
            exp: Utc::now().timestamp() + ttl.as_secs() as i64,
            iss: self.issuer.clone(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| GatewayError::internal(format!("Failed to sign token: {}", e)))
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, token: &str) -> GatewayResult<Principal> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => GatewayError::auth("Token has expired"),
                ErrorKind::InvalidIssuer => GatewayError::auth("Token issuer is not trusted"),
                ErrorKind::InvalidSignature => GatewayError::auth("Invalid token signature"),
                _ => GatewayError::auth("Could not validate credentials"),
            }
        })?;

        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(GatewayError::auth("Token has no subject"));
        }

        let mut principal = Principal::new(claims.sub, claims.scopes);
        principal.expires_at = Utc.timestamp_opt(claims.exp, 0).single();
        Ok(principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(secret: &str) -> JwtSettings {
        JwtSettings {
            secret: secret.to_string(),
            issuer: Some("intent-gateway".to_string()),
            leeway_seconds: 0,
        }
    }

    #[tokio::test]
    async fn test_issued_token_authenticates() {
        let authenticator = JwtAuthenticator::new(&settings("secret"));
        let token = authenticator
            .issue("alice", ["read", "write"], Duration::from_secs(60))
            .unwrap();

        let principal = authenticator.authenticate(&token).await.unwrap();
        assert_eq!(principal.subject, "alice");
        assert!(principal.has_scope("write"));
        assert!(principal.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_rejects_wrong_secret() {
        let issuer = JwtAuthenticator::new(&settings("one"));
        let verifier = JwtAuthenticator::new(&settings("two"));
        let token = issuer
            .issue("alice", ["read"], Duration::from_secs(60))
            .unwrap();

        let err = verifier.authenticate(&token).await.unwrap_err();
        assert_eq!(err.code(), "AUTH_ERROR");
        assert_eq!(err.status_code(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_rejects_expired_token() {
        let authenticator = JwtAuthenticator::new(&settings("secret"));
        let claims = Claims {
            sub: "alice".to_string(),
            scopes: vec![],
            exp: Utc::now().timestamp() - 3600,
            iss: Some("intent-gateway".to_string()),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();

        let err = authenticator.authenticate(&token).await.unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn test_rejects_garbage() {
        let authenticator = JwtAuthenticator::new(&settings("secret"));
        assert!(authenticator.authenticate("not-a-jwt").await.is_err());
    }
}
