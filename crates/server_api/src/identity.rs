use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

/// Platform user resolved from a bearer token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: UserId,
    pub email: Option<String>,
    #[serde(default)]
    pub attrs: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("token is invalid or expired")]
    InvalidToken,
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

/// External identity service. Implementations own token validation entirely.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify_bearer_token(&self, token: &str) -> Result<AuthenticatedUser, IdentityError>;
}

/// Fixed token table, for local development and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentityProvider {
    tokens: HashMap<String, AuthenticatedUser>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<UserId>) -> Self {
        let user = AuthenticatedUser {
            user_id: user_id.into(),
            email: None,
            attrs: HashMap::new(),
        };
        self.tokens.insert(token.into(), user);
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn verify_bearer_token(&self, token: &str) -> Result<AuthenticatedUser, IdentityError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(IdentityError::InvalidToken)
    }
}

/// Resolves an `Authorization` header value (with or without the `Bearer `
/// prefix). Every failure maps to `unauthorized`.
pub async fn authenticate(
    provider: &dyn IdentityProvider,
    authorization: &str,
) -> Result<AuthenticatedUser, ApiError> {
    let raw = authorization.trim();
    let token = raw
        .strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .unwrap_or(raw)
        .trim();
    if token.is_empty() {
        return Err(ApiError::new(ErrorCode::Unauthorized, "missing bearer token"));
    }
    provider.verify_bearer_token(token).await.map_err(|err| {
        tracing::debug!(error = %err, "bearer token rejected");
        ApiError::new(ErrorCode::Unauthorized, err.to_string())
    })
}
