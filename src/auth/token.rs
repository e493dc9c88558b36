use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{GatewayError, Result};

/// JWT Claims structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Tenant the identity belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    /// Role names granted to the identity
    #[serde(default)]
    pub roles: Vec<String>,
    /// Fine-grained permission scopes
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Expiration time (as UTC timestamp)
    pub exp: usize,
    /// Issued at (as UTC timestamp)
    pub iat: usize,
    /// Not before (as UTC timestamp)
    pub nbf: usize,
}

impl Claims {
    /// Creates new claims for a user, valid for 24 hours.
    pub fn new(user_id: String, tenant: Option<String>) -> Self {
        let now = unix_now();
        Self {
            sub: user_id,
            tenant,
            roles: Vec::new(),
            scopes: Vec::new(),
            exp: now + 86400,
            iat: now,
            nbf: now,
        }
    }

    /// Creates claims with roles and scopes attached.
    pub fn with_grants(
        user_id: String,
        tenant: Option<String>,
        roles: Vec<String>,
        scopes: Vec<String>,
    ) -> Self {
        let mut claims = Self::new(user_id, tenant);
        claims.roles = roles;
        claims.scopes = scopes;
        claims
    }

    /// Creates claims with a custom validity window in seconds.
    pub fn with_expiration(user_id: String, tenant: Option<String>, valid_secs: usize) -> Self {
        let mut claims = Self::new(user_id, tenant);
        claims.exp = claims.iat + valid_secs;
        claims
    }
}

fn unix_now() -> usize {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs() as usize
}

/// Manages JWT token operations
pub struct TokenManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenManager {
    /// Creates a new token manager. `clock_skew` is the tolerated drift
    /// between issuer and gateway clocks when checking exp/nbf.
    pub fn new(secret: &str, clock_skew: Duration) -> Self {
        let mut validation = Validation::default();
        validation.leeway = clock_skew.as_secs();
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Generates a JWT token for the given claims
    pub fn generate_token(&self, claims: &Claims) -> Result<String> {
        encode(&Header::default(), claims, &self.encoding_key)
            .map_err(|e| GatewayError::Unauthenticated(format!("Failed to generate token: {}", e)))
    }

    /// Validates and decodes a JWT token. Expiry and not-before are checked
    /// by the library against current time, within the configured leeway.
    pub fn validate_token(&self, token: &str) -> Result<TokenData<Claims>> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| GatewayError::Unauthenticated(format!("Invalid token: {}", e)))
    }

    /// Extracts claims from a token string
    pub fn get_claims(&self, token: &str) -> Result<Claims> {
        let token_data = self.validate_token(token)?;
        Ok(token_data.claims)
    }
}

/// Extracts bearer token from an Authorization header value
pub fn extract_bearer_token(auth_header: &str) -> Option<String> {
    auth_header
        .strip_prefix("Bearer ")
        .map(|token| token.to_string())
}
