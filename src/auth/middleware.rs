//! Pluggable token verification
//!
//! The gateway never stores credentials; it validates tokens issued by an
//! external identity collaborator. Verification strategies are pluggable:
//! a local HMAC signature check is the default, and a custom `TokenVerifier`
//! can delegate to a remote identity service.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::token::{Claims, TokenManager};
use crate::error::{GatewayError, Result};

/// Identity information yielded by a successful validation
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub tenant_id: Option<String>,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl AuthContext {
    fn from_claims(claims: Claims) -> Self {
        let expires_at = Utc
            .timestamp_opt(claims.exp as i64, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self {
            user_id: claims.sub,
            tenant_id: claims.tenant,
            roles: claims.roles,
            permissions: claims.scopes,
            expires_at,
        }
    }
}

/// Trait for token verification strategies
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a raw token and return the identity it proves.
    /// Invalid or expired tokens fail with `Unauthenticated`.
    async fn verify(&self, token: &str) -> Result<AuthContext>;

    /// Verifier name for logging
    fn verifier_name(&self) -> &'static str;
}

/// Local HMAC signature verification via jsonwebtoken
pub struct LocalTokenVerifier {
    tokens: TokenManager,
}

impl LocalTokenVerifier {
    pub fn new(secret: &str, clock_skew: Duration) -> Self {
        Self {
            tokens: TokenManager::new(secret, clock_skew),
        }
    }
}

#[async_trait]
impl TokenVerifier for LocalTokenVerifier {
    async fn verify(&self, token: &str) -> Result<AuthContext> {
        let claims = self.tokens.get_claims(token)?;
        Ok(AuthContext::from_claims(claims))
    }

    fn verifier_name(&self) -> &'static str {
        "local_hmac"
    }
}

/// Validates credentials for the session layer and applies the scope gate.
pub struct AuthMiddleware {
    verifier: Arc<dyn TokenVerifier>,
    /// Scope a token must carry to connect (None = any valid identity)
    required_scope: Option<String>,
}

impl AuthMiddleware {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            verifier,
            required_scope: None,
        }
    }

    pub fn with_required_scope(mut self, scope: String) -> Self {
        self.required_scope = Some(scope);
        self
    }

    /// Validate a token: `Unauthenticated` for invalid/expired tokens,
    /// `Unauthorized` for a valid identity lacking the required scope.
    pub async fn validate(&self, token: &str) -> Result<AuthContext> {
        let context = self.verifier.verify(token).await?;

        if let Some(ref scope) = self.required_scope {
            if !context.permissions.iter().any(|p| p == scope) {
                log::debug!(
                    "Token for user {} lacks required scope '{}' (verifier: {})",
                    context.user_id,
                    scope,
                    self.verifier.verifier_name()
                );
                return Err(GatewayError::Unauthorized(format!(
                    "missing required scope '{}'",
                    scope
                )));
            }
        }

        Ok(context)
    }
}
