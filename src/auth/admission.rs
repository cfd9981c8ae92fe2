use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use std::sync::Arc;
use tracing::{error, info};

use crate::access::IdentityProvider;
use crate::models::{AuthError, Identity};

/// Connection admission gate. Runs before any room operation; a connection
/// that fails here is refused outright and never reaches the registry.
pub struct Admission {
    jwt_secret: String,
    identities: Arc<dyn IdentityProvider>,
}

impl Admission {
    pub fn new(jwt_secret: String, identities: Arc<dyn IdentityProvider>) -> Self {
        Self {
            jwt_secret,
            identities,
        }
    }

    /// Validate a credential token and resolve it to a known identity.
    pub async fn admit(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        let token = token.ok_or(AuthError::Missing)?;

        let token_data = validate_jwt(token, &self.jwt_secret).map_err(|e| {
            if matches!(
                e.kind(),
                jsonwebtoken::errors::ErrorKind::ExpiredSignature
            ) {
                AuthError::Expired
            } else {
                error!("JWT validation failed: {}", e);
                AuthError::Invalid
            }
        })?;

        let uid = token_data
            .claims
            .get("sub")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                error!("JWT token does not contain 'sub' claim");
                AuthError::Invalid
            })?;

        // The subject may have been deleted since the token was issued;
        // the identity store is authoritative.
        let identity = self.identities.resolve(uid).await?;
        info!("Admitted connection for user {}", identity.user_id);
        Ok(identity)
    }
}

/// Validate a JWT token and return the token data
pub fn validate_jwt(
    token: &str,
    secret: &str,
) -> Result<TokenData<serde_json::Value>, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    decode::<serde_json::Value>(token, &decoding_key, &validation)
}
