//! Credential port: the engine's only view of the encrypted credential
//! store.
//!
//! Login and encrypted storage live outside the engine; the agent manager
//! asks this provider for a short-lived access token immediately before
//! spawning a supervisor and discards it afterwards.

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Supplies a decrypted hosting access token for a user.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self, user_id: Uuid) -> Result<String>;
}

/// A provider that hands out one fixed token. Development and tests.
pub struct StaticCredentials {
    token: String,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn access_token(&self, _user_id: Uuid) -> Result<String> {
        Ok(self.token.clone())
    }
}
