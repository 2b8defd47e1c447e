//! Registry client for the Docker/OCI v2 distribution protocol
//!
//! A thin, stateless HTTP client: manifest GET with content-type
//! negotiation, platform resolution against manifest lists, and blob
//! streaming with ranged continuation. Credentials come from a
//! [`CredentialProvider`]; a 401 triggers exactly one refresh before the
//! failure is surfaced. Retries beyond that are the scheduler's business.

use crate::config::RegistrySource;
use crate::digest::DigestUtils;
use crate::error::{classify_status, FetcherError, Result};
use crate::image::manifest::{self, ManifestKind, Platform, MANIFEST_ACCEPT};
use crate::image::ImageManifest;
use crate::logging::Logger;
use crate::registry::CredentialProvider;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

/// Raw manifest GET result
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub bytes: Vec<u8>,
    pub media_type: String,
    pub digest: String,
}

/// A coordinate resolved down to one concrete per-platform manifest
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub manifest: ImageManifest,
    pub manifest_bytes: Vec<u8>,
    pub media_type: String,
    pub digest: String,
}

#[derive(Clone)]
pub struct RegistryClient {
    client: Client,
    credentials: Arc<dyn CredentialProvider>,
    output: Logger,
    request_timeout: Duration,
}

pub struct RegistryClientBuilder {
    credentials: Arc<dyn CredentialProvider>,
    connect_timeout: Duration,
    request_timeout: Duration,
    output: Logger,
}

impl RegistryClientBuilder {
    pub fn new(credentials: Arc<dyn CredentialProvider>, output: Logger) -> Self {
        Self {
            credentials,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            output,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<RegistryClient> {
        self.output.verbose("Building HTTP client...");

        // No overall timeout: blob streams must be allowed to run for as
        // long as bytes keep arriving. Control-plane requests get a
        // per-request timeout instead.
        let client = Client::builder()
            .connect_timeout(self.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(300))
            .pool_max_idle_per_host(10)
            .user_agent("docker-image-fetcher/0.1")
            .build()
            .map_err(|e| FetcherError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(RegistryClient {
            client,
            credentials: self.credentials,
            output: self.output,
            request_timeout: self.request_timeout,
        })
    }
}

impl RegistryClient {
    /// GET a manifest by tag or digest.
    ///
    /// Sends the four-way Accept header so lists, indexes and concrete
    /// manifests all come back from a single request. Returns the raw body,
    /// the response content type, and the manifest digest
    /// (`Docker-Content-Digest`, or computed from the body when absent).
    pub async fn get_manifest(
        &self,
        source: &RegistrySource,
        repository: &str,
        reference: &str,
    ) -> Result<FetchedManifest> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            source.registry_url, repository, reference
        );
        self.output
            .verbose(&format!("Fetching manifest {}:{}", repository, reference));

        let mut credential = self.credentials.credential_for(source, repository).await?;
        let mut refreshed = false;

        loop {
            let request = self
                .client
                .get(&url)
                .header("Accept", MANIFEST_ACCEPT)
                .timeout(self.request_timeout);
            let response = credential.apply(request).send().await.map_err(|e| {
                FetcherError::Transport(format!("failed to fetch manifest: {}", e))
            })?;

            let status = response.status().as_u16();
            if status == 401 && !refreshed {
                refreshed = true;
                credential = self.credentials.refresh(source, repository).await?;
                continue;
            }
            if !(200..300).contains(&status) {
                return Err(classify_status(
                    status,
                    &format!("manifest {}:{}", repository, reference),
                ));
            }

            let media_type = response
                .headers()
                .get("Content-Type")
                .and_then(|h| h.to_str().ok())
                .unwrap_or("application/vnd.docker.distribution.manifest.v2+json")
                .to_string();
            let header_digest = response
                .headers()
                .get("Docker-Content-Digest")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.to_string());

            let bytes = response
                .bytes()
                .await
                .map_err(|e| {
                    FetcherError::Transport(format!("failed to read manifest body: {}", e))
                })?
                .to_vec();

            let computed = DigestUtils::compute_registry_digest(&bytes);
            let digest = match header_digest {
                Some(header) => {
                    if DigestUtils::is_valid_registry_digest(&header) && header != computed {
                        return Err(FetcherError::Protocol(format!(
                            "manifest digest mismatch: header {}, body {}",
                            header, computed
                        )));
                    }
                    header
                }
                None => computed,
            };

            self.output.detail(&format!(
                "Manifest type {}, digest {}",
                media_type,
                DigestUtils::format_digest_short(&digest)
            ));

            return Ok(FetchedManifest {
                bytes,
                media_type,
                digest,
            });
        }
    }

    /// Resolve a reference down to a concrete per-platform manifest.
    ///
    /// When the first GET returns a manifest list or OCI index, the matching
    /// entry for `platform` is picked and the concrete manifest re-fetched
    /// by digest.
    pub async fn resolve_manifest(
        &self,
        source: &RegistrySource,
        repository: &str,
        reference: &str,
        platform: &Platform,
    ) -> Result<ResolvedImage> {
        let fetched = self.get_manifest(source, repository, reference).await?;

        let fetched = if ManifestKind::from_media_type(&fetched.media_type).is_index() {
            let index = manifest::parse_index(&fetched.bytes)?;
            let child_digest = manifest::select_platform(&index, platform)?;
            self.output.verbose(&format!(
                "Selected platform {} -> {}",
                platform,
                DigestUtils::format_digest_short(&child_digest)
            ));
            let child = self.get_manifest(source, repository, &child_digest).await?;
            if ManifestKind::from_media_type(&child.media_type).is_index() {
                return Err(FetcherError::Protocol(format!(
                    "manifest list entry {} resolved to another list",
                    child_digest
                )));
            }
            child
        } else {
            fetched
        };

        let parsed = manifest::parse_manifest(&fetched.bytes)?;
        Ok(ResolvedImage {
            manifest: parsed,
            manifest_bytes: fetched.bytes,
            media_type: fetched.media_type,
            digest: fetched.digest,
        })
    }

    /// Open a streaming GET for a blob.
    ///
    /// With `offset > 0` a `Range: bytes=<offset>-` header is sent; the
    /// caller must inspect the status code: 206 means append at `offset`,
    /// 200 means the server ignored the range and the caller restarts the
    /// blob from zero.
    pub async fn stream_blob(
        &self,
        source: &RegistrySource,
        repository: &str,
        digest: &str,
        offset: u64,
    ) -> Result<reqwest::Response> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            source.registry_url, repository, digest
        );

        let mut credential = self.credentials.credential_for(source, repository).await?;
        let mut refreshed = false;

        loop {
            let mut request = self.client.get(&url);
            if offset > 0 {
                request = request.header("Range", format!("bytes={}-", offset));
            }
            let response = credential.apply(request).send().await.map_err(|e| {
                FetcherError::Transport(format!("failed to open blob stream: {}", e))
            })?;

            let status = response.status().as_u16();
            if status == 401 && !refreshed {
                refreshed = true;
                credential = self.credentials.refresh(source, repository).await?;
                continue;
            }
            if !(200..300).contains(&status) {
                return Err(classify_status(
                    status,
                    &format!("blob {}", DigestUtils::format_digest_short(digest)),
                ));
            }

            return Ok(response);
        }
    }

    /// Buffered GET for a small blob such as the image config, with digest
    /// verification. Unlike layer streams this carries the control-plane
    /// request timeout.
    pub async fn get_blob(
        &self,
        source: &RegistrySource,
        repository: &str,
        digest: &str,
    ) -> Result<Vec<u8>> {
        let fetch = async {
            let response = self.stream_blob(source, repository, digest, 0).await?;
            let bytes = response
                .bytes()
                .await
                .map_err(|e| FetcherError::Transport(format!("failed to read blob body: {}", e)))?
                .to_vec();
            Ok::<_, FetcherError>(bytes)
        };
        let bytes = tokio::time::timeout(self.request_timeout, fetch)
            .await
            .map_err(|_| {
                FetcherError::Transport(format!(
                    "blob {} request timed out",
                    DigestUtils::format_digest_short(digest)
                ))
            })??;
        DigestUtils::verify_data_integrity(&bytes, digest)?;
        Ok(bytes)
    }

    /// Total image size in bytes (config + layers) for a coordinate, from
    /// manifests alone, without any blob traffic.
    pub async fn probe_size(
        &self,
        source: &RegistrySource,
        repository: &str,
        reference: &str,
        platform: &Platform,
    ) -> Result<u64> {
        let resolved = self
            .resolve_manifest(source, repository, reference, platform)
            .await?;
        Ok(resolved.manifest.total_bytes())
    }
}
