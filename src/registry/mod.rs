//! Docker/OCI v2 registry protocol client
//!
//! The client is stateless; authentication state lives in the
//! [`TokenManager`], which the client consults through the
//! [`CredentialProvider`] trait.

pub mod auth;
pub mod client;
pub mod token_manager;

pub use auth::{Auth, AuthChallenge, Credential, TokenInfo};
pub use client::{FetchedManifest, RegistryClient, RegistryClientBuilder, ResolvedImage};
pub use token_manager::TokenManager;

use crate::config::RegistrySource;
use crate::error::Result;

/// Resolves the credential to attach to registry requests for a repository.
///
/// Implementations cache tokens and refresh them on demand; the client calls
/// `refresh` exactly once when a request comes back 401.
#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Credential for requests against `repository`, from cache if possible
    async fn credential_for(
        &self,
        source: &RegistrySource,
        repository: &str,
    ) -> Result<Credential>;

    /// Force a fresh credential, bypassing the cache
    async fn refresh(&self, source: &RegistrySource, repository: &str) -> Result<Credential>;
}
