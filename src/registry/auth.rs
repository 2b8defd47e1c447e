//! Registry authentication: the Docker Registry API v2 token handshake
//!
//! A registry either answers `GET /v2/` with 200 (anonymous access), or with
//! 401 plus a `WWW-Authenticate: Bearer` challenge naming the token
//! endpoint. For the latter we exchange optional basic credentials for a
//! pull-scoped bearer token.

use crate::config::RegistrySource;
use crate::error::{FetcherError, Result};
use crate::logging::Logger;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Credential to attach to a registry request
#[derive(Debug, Clone)]
pub enum Credential {
    Anonymous,
    Bearer(String),
    Basic { username: String, password: String },
}

impl Credential {
    /// Attach this credential to a request
    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Credential::Anonymous => request,
            Credential::Bearer(token) => request.bearer_auth(token),
            Credential::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub token: Option<String>,
    // Some registries use the OAuth2 field name instead
    pub access_token: Option<String>,
    pub expires_in: Option<u64>,
}

impl TokenResponse {
    fn into_token(self) -> Result<(String, Option<u64>)> {
        match self.token.or(self.access_token) {
            Some(token) => Ok((token, self.expires_in)),
            None => Err(FetcherError::Auth(
                "token endpoint response carried no token".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub credential: Credential,
    pub expires_at: Option<Instant>,
}

impl TokenInfo {
    pub fn new(credential: Credential, expires_in: Option<u64>) -> Self {
        let expires_at = expires_in.map(|seconds| {
            // 1 minute buffer so we refresh before the registry cuts us off
            Instant::now() + Duration::from_secs(seconds.saturating_sub(60))
        });
        Self {
            credential,
            expires_at,
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Instant::now() > expires_at,
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub realm: String,
    pub service: Option<String>,
}

/// Performs the v2 authentication handshake for one registry endpoint
#[derive(Clone)]
pub struct Auth {
    client: Client,
    output: Logger,
}

impl Auth {
    pub fn new(client: Client, output: Logger) -> Self {
        Self { client, output }
    }

    /// Parse a `WWW-Authenticate` header per the Docker Registry API v2 spec
    fn parse_www_authenticate(header_value: &str) -> Result<AuthChallenge> {
        let params_str = header_value.strip_prefix("Bearer ").ok_or_else(|| {
            FetcherError::Auth("only Bearer authentication is supported".to_string())
        })?;

        let mut params = HashMap::new();
        for param in params_str.split(',') {
            let param = param.trim();
            if let Some(eq_pos) = param.find('=') {
                let key = param[..eq_pos].trim();
                let value = param[eq_pos + 1..].trim().trim_matches('"');
                params.insert(key, value);
            }
        }

        let realm = params
            .get("realm")
            .ok_or_else(|| {
                FetcherError::Auth("missing realm in WWW-Authenticate header".to_string())
            })?
            .to_string();

        Ok(AuthChallenge {
            realm,
            service: params.get("service").map(|s| s.to_string()),
        })
    }

    /// Resolve the credential for pulling from `repository` on `source`.
    ///
    /// Pings `/v2/`; 200 means the registry takes requests as-is (anonymous,
    /// or basic when credentials are configured), 401 starts the token
    /// exchange for scope `repository:<repo>:pull`.
    pub async fn authenticate(
        &self,
        source: &RegistrySource,
        repository: &str,
    ) -> Result<TokenInfo> {
        self.output
            .verbose(&format!("Authenticating against {}...", source.registry_url));

        let ping_url = format!("{}/v2/", source.registry_url);
        let response = self
            .client
            .get(&ping_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| FetcherError::Transport(format!("failed to ping registry: {}", e)))?;

        match response.status().as_u16() {
            200 => {
                self.output.verbose("Registry does not require a token");
                let credential = match &source.auth {
                    Some(auth) => Credential::Basic {
                        username: auth.username.clone(),
                        password: auth.password.clone(),
                    },
                    None => Credential::Anonymous,
                };
                Ok(TokenInfo::new(credential, None))
            }
            401 => {
                let www_auth = response
                    .headers()
                    .get("www-authenticate")
                    .and_then(|h| h.to_str().ok())
                    .ok_or_else(|| {
                        FetcherError::Auth(
                            "missing WWW-Authenticate header in 401 response".to_string(),
                        )
                    })?;

                let challenge = Self::parse_www_authenticate(www_auth)?;
                self.output.verbose(&format!(
                    "Auth challenge: realm={}, service={:?}",
                    challenge.realm, challenge.service
                ));

                self.request_token(&challenge, source, repository).await
            }
            status => Err(FetcherError::Auth(format!(
                "unexpected status {} when probing registry authentication",
                status
            ))),
        }
    }

    async fn request_token(
        &self,
        challenge: &AuthChallenge,
        source: &RegistrySource,
        repository: &str,
    ) -> Result<TokenInfo> {
        let mut url = reqwest::Url::parse(&challenge.realm)
            .map_err(|e| FetcherError::Auth(format!("invalid auth realm URL: {}", e)))?;

        if let Some(service) = &challenge.service {
            url.query_pairs_mut().append_pair("service", service);
        }

        let scope = format!("repository:{}:pull", repository);
        url.query_pairs_mut().append_pair("scope", &scope);

        self.output
            .verbose(&format!("Requesting pull token from: {}", url));

        let mut request = self.client.get(url).timeout(Duration::from_secs(10));
        if let Some(auth) = &source.auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetcherError::Transport(format!("failed to request auth token: {}", e)))?;

        if response.status().is_success() {
            let token_response: TokenResponse = response
                .json()
                .await
                .map_err(|e| FetcherError::Auth(format!("failed to parse auth response: {}", e)))?;

            let (token, expires_in) = token_response.into_token()?;
            self.output.verbose(&format!(
                "Obtained pull token (expires in {:?} seconds)",
                expires_in
            ));

            Ok(TokenInfo::new(Credential::Bearer(token), expires_in))
        } else {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            Err(FetcherError::Auth(format!(
                "token request failed (status {}): {}",
                status, error_text
            )))
        }
    }
}
