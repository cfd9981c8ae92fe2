use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::models::{AccessError, AuthError, Identity, Role};

/// External access-control collaborator: who may do what on a document.
#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn check_access(&self, user_id: &str, document_id: Uuid) -> Result<Role, AccessError>;
}

/// External identity store: resolves a token subject to a known identity.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self, user_id: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ServiceClaims {
    sub: String,
    #[serde(rename = "type")]
    type_: String,
    exp: usize,
}

/// Client for the app service, which owns users and document grants.
/// Lookups are cached with a time-to-idle policy so a member's role is
/// resolved once per stay, not per operation.
pub struct AppServiceClient {
    client: reqwest::Client,
    base_url: String,
    jwt_secret: String,
    service_name: String,
    grant_cache: Cache<(String, Uuid), Role>,
    identity_cache: Cache<String, Identity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantResponse {
    role: Role,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserResponse {
    display_name: String,
    color: Option<String>,
    avatar: Option<String>,
}

impl AppServiceClient {
    pub fn new(base_url: String, jwt_secret: String, service_name: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build reqwest client");

        Self {
            client,
            base_url,
            jwt_secret,
            service_name,
            grant_cache: Cache::builder()
                .max_capacity(100_000)
                .time_to_idle(Duration::from_secs(5 * 60))
                .build(),
            identity_cache: Cache::builder()
                .max_capacity(100_000)
                .time_to_idle(Duration::from_secs(5 * 60))
                .build(),
        }
    }

    fn generate_token(&self) -> String {
        let expiration = Utc::now()
            .checked_add_signed(ChronoDuration::seconds(60)) // 1 minute expiration
            .expect("valid timestamp")
            .timestamp();

        let claims = ServiceClaims {
            sub: self.service_name.clone(),
            type_: "service".to_string(),
            exp: expiration as usize,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .expect("Failed to generate JWT")
    }
}

#[async_trait]
impl AccessControl for AppServiceClient {
    async fn check_access(&self, user_id: &str, document_id: Uuid) -> Result<Role, AccessError> {
        if let Some(role) = self.grant_cache.get(&(user_id.to_string(), document_id)) {
            return Ok(role);
        }

        info!("Grant cache miss for user {} on document {}", user_id, document_id);
        let token = self.generate_token();
        let url = format!("{}/auth/grants/{}/{}", self.base_url, user_id, document_id);
        let resp = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await
            .map_err(|e| AccessError::Unavailable(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::FORBIDDEN
            || resp.status() == reqwest::StatusCode::NOT_FOUND
        {
            return Err(AccessError::Denied);
        }

        let grant: GrantResponse = resp
            .error_for_status()
            .map_err(|e| AccessError::Unavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| AccessError::Unavailable(e.to_string()))?;

        self.grant_cache
            .insert((user_id.to_string(), document_id), grant.role);
        Ok(grant.role)
    }
}

#[async_trait]
impl IdentityProvider for AppServiceClient {
    async fn resolve(&self, user_id: &str) -> Result<Identity, AuthError> {
        if let Some(identity) = self.identity_cache.get(user_id) {
            return Ok(identity);
        }

        let token = self.generate_token();
        let url = format!("{}/auth/users/{}", self.base_url, user_id);
        let resp = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await
            .map_err(|e| {
                error!("Failed to resolve identity for {}: {}", user_id, e);
                AuthError::UnknownSubject
            })?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AuthError::UnknownSubject);
        }

        let user: UserResponse = resp
            .error_for_status()
            .map_err(|e| {
                error!("Identity lookup failed for {}: {}", user_id, e);
                AuthError::UnknownSubject
            })?
            .json()
            .await
            .map_err(|e| {
                error!("Malformed identity response for {}: {}", user_id, e);
                AuthError::UnknownSubject
            })?;

        let identity = Identity {
            user_id: user_id.to_string(),
            display_name: user.display_name,
            color: user.color.unwrap_or_else(|| fallback_color(user_id)),
            avatar: user.avatar,
        };
        self.identity_cache
            .insert(user_id.to_string(), identity.clone());
        Ok(identity)
    }
}

/// Grants every known user the same role. Used when no app service is
/// configured and in tests.
pub struct FixedAccess {
    pub role: Role,
}

#[async_trait]
impl AccessControl for FixedAccess {
    async fn check_access(&self, _user_id: &str, _document_id: Uuid) -> Result<Role, AccessError> {
        Ok(self.role)
    }
}

/// Derives an identity from the token subject alone. Used when no app
/// service is configured.
pub struct LocalIdentityProvider;

#[async_trait]
impl IdentityProvider for LocalIdentityProvider {
    async fn resolve(&self, user_id: &str) -> Result<Identity, AuthError> {
        Ok(Identity {
            user_id: user_id.to_string(),
            display_name: user_id.to_string(),
            color: fallback_color(user_id),
            avatar: None,
        })
    }
}

const CURSOR_PALETTE: [&str; 8] = [
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#46f0f0", "#f032e6", "#008080",
];

fn fallback_color(user_id: &str) -> String {
    let hash: usize = user_id.bytes().fold(0usize, |acc, b| {
        acc.wrapping_mul(31).wrapping_add(b as usize)
    });
    CURSOR_PALETTE[hash % CURSOR_PALETTE.len()].to_string()
}
