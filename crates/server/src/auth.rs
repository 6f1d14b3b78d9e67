use crate::config::TokenEntry;
use async_trait::async_trait;
use flock_storage::StorageError;
use std::collections::HashMap;

/// Resolves an opaque session token to the user it belongs to.
#[async_trait]
pub trait AccessVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Option<String>, StorageError>;
}

/// Rejects every token. Used when no credentials are configured so that an
/// empty deployment fails closed.
pub struct DenyAllVerifier;

#[async_trait]
impl AccessVerifier for DenyAllVerifier {
    async fn verify(&self, _token: &str) -> Result<Option<String>, StorageError> {
        Ok(None)
    }
}

/// Verifies tokens against a fixed table from configuration.
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new(entries: &[TokenEntry]) -> Self {
        let tokens = entries
            .iter()
            .map(|entry| (entry.token.clone(), entry.user_id.clone()))
            .collect();
        Self { tokens }
    }
}

#[async_trait]
impl AccessVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Option<String>, StorageError> {
        Ok(self.tokens.get(token).cloned())
    }
}
