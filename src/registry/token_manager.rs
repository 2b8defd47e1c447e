//! Token management for long-running pull operations
//!
//! Caches one pull-scoped credential per `(source, repository)` pair and
//! refreshes it when it expires or when the registry answers 401. Large
//! image downloads routinely outlive Docker Hub's token lifetime, so the
//! refresh path is exercised in normal operation, not only on clock skew.

use crate::config::RegistrySource;
use crate::error::{FetcherError, Result};
use crate::logging::Logger;
use crate::registry::auth::{Auth, Credential, TokenInfo};
use crate::registry::CredentialProvider;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Thread-safe credential cache keyed by source name and repository
#[derive(Clone)]
pub struct TokenManager {
    auth: Auth,
    tokens: Arc<RwLock<HashMap<(String, String), TokenInfo>>>,
    output: Logger,
}

impl TokenManager {
    pub fn new(auth: Auth, output: Logger) -> Self {
        Self {
            auth,
            tokens: Arc::new(RwLock::new(HashMap::new())),
            output,
        }
    }

    fn cached(&self, key: &(String, String)) -> Result<Option<TokenInfo>> {
        let guard = self
            .tokens
            .read()
            .map_err(|_| FetcherError::Auth("token cache lock poisoned".to_string()))?;
        Ok(guard.get(key).cloned())
    }

    fn store(&self, key: (String, String), info: TokenInfo) -> Result<()> {
        let mut guard = self
            .tokens
            .write()
            .map_err(|_| FetcherError::Auth("token cache lock poisoned".to_string()))?;
        guard.insert(key, info);
        Ok(())
    }
}

#[async_trait::async_trait]
impl CredentialProvider for TokenManager {
    async fn credential_for(
        &self,
        source: &RegistrySource,
        repository: &str,
    ) -> Result<Credential> {
        let key = (source.name.clone(), repository.to_string());

        if let Some(info) = self.cached(&key)? {
            if !info.is_expired() {
                return Ok(info.credential);
            }
            self.output
                .verbose(&format!("Pull token for {} expired, refreshing", repository));
        }

        self.refresh(source, repository).await
    }

    async fn refresh(&self, source: &RegistrySource, repository: &str) -> Result<Credential> {
        let key = (source.name.clone(), repository.to_string());
        let info = self.auth.authenticate(source, repository).await?;
        let credential = info.credential.clone();
        self.store(key, info)?;
        Ok(credential)
    }
}
