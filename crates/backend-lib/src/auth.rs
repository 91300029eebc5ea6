// ============================
// crates/backend-lib/src/auth.rs
// ============================
//! Authentication seam for the transport handshake.
//!
//! Token mechanics (issuing, signing, refresh) live in the surrounding
//! account service; the realtime core only needs "does this bearer token
//! resolve to a user id".

use crate::error::AppError;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tripline_common::UserId;

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Decode a bearer token to the user id it was issued for.
    async fn verify(&self, token: &str) -> Result<UserId, AppError>;
}

/// Token table for tests and local runs: a plain token -> user id map.
#[derive(Default)]
pub struct StaticTokens {
    tokens: RwLock<HashMap<String, UserId>>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, token: impl Into<String>, user_id: impl Into<UserId>) {
        self.tokens.write().await.insert(token.into(), user_id.into());
    }
}

#[async_trait]
impl TokenVerifier for StaticTokens {
    async fn verify(&self, token: &str) -> Result<UserId, AppError> {
        self.tokens
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or_else(|| AppError::Unauthorized("invalid or expired token".to_string()))
    }
}
