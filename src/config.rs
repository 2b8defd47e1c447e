//! Configuration structures and utilities

use crate::error::{FetcherError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

impl AuthConfig {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}

/// A known registry endpoint a task coordinate can name as its `source`.
#[derive(Debug, Clone)]
pub struct RegistrySource {
    /// Source name as used in task coordinates (`dockerhub`, `quay`, ...)
    pub name: String,
    /// Base URL of the registry, e.g. `https://registry-1.docker.io`
    pub registry_url: String,
    /// Basic credentials for private registries
    pub auth: Option<AuthConfig>,
}

impl RegistrySource {
    pub fn new(name: &str, registry_url: &str) -> Self {
        Self {
            name: name.to_string(),
            registry_url: registry_url.trim_end_matches('/').to_string(),
            auth: None,
        }
    }

    pub fn with_auth(mut self, auth: Option<AuthConfig>) -> Self {
        self.auth = auth;
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub bind_address: String,
    pub port: u16,
    /// Root directory for task state and downloaded image content
    pub downloads_root: PathBuf,
    /// Maximum tasks in the fetching stage at once
    pub max_concurrent_tasks: usize,
    /// Maximum in-flight blob transfers within a single task
    pub blobs_per_task: usize,
    /// Transient-failure budget per task
    pub max_retries: u32,
    /// Base delay for retry backoff (doubles per attempt, capped)
    pub retry_base_delay: Duration,
    /// Upper bound on retry backoff
    pub retry_max_delay: Duration,
    /// Re-admit interrupted tasks on startup instead of parking them as paused
    pub resume_on_start: bool,
    pub verbose: bool,
    pub quiet: bool,
    /// Custom registry reachable under the `custom` source name
    pub custom_registry: Option<RegistrySource>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8550,
            downloads_root: PathBuf::from("downloads"),
            max_concurrent_tasks: 3,
            blobs_per_task: 5,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(5),
            retry_max_delay: Duration::from_secs(60),
            resume_on_start: true,
            verbose: false,
            quiet: false,
            custom_registry: None,
        }
    }
}

impl FetcherConfig {
    pub fn with_downloads_root(mut self, root: PathBuf) -> Self {
        self.downloads_root = root;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, n: usize) -> Self {
        self.max_concurrent_tasks = n.max(1);
        self
    }

    pub fn with_blobs_per_task(mut self, n: usize) -> Self {
        self.blobs_per_task = n.max(1);
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_resume_on_start(mut self, resume: bool) -> Self {
        self.resume_on_start = resume;
        self
    }

    pub fn with_custom_registry(mut self, source: Option<RegistrySource>) -> Self {
        self.custom_registry = source;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Override settings from environment variables if present
    pub fn from_env(mut self) -> Self {
        if let Ok(root) = std::env::var("IMAGE_FETCHER_ROOT") {
            self.downloads_root = PathBuf::from(root);
        }

        if let Ok(n) = std::env::var("IMAGE_FETCHER_MAX_TASKS") {
            if let Ok(n) = n.parse::<usize>() {
                self.max_concurrent_tasks = n.max(1);
            }
        }

        if let Ok(n) = std::env::var("IMAGE_FETCHER_MAX_BLOBS") {
            if let Ok(n) = n.parse::<usize>() {
                self.blobs_per_task = n.max(1);
            }
        }

        if let Ok(n) = std::env::var("IMAGE_FETCHER_MAX_RETRIES") {
            if let Ok(n) = n.parse() {
                self.max_retries = n;
            }
        }

        if let Ok(v) = std::env::var("IMAGE_FETCHER_RESUME_ON_START") {
            self.resume_on_start = !matches!(v.as_str(), "0" | "false" | "no");
        }

        if let Ok(level) = std::env::var("IMAGE_FETCHER_LOG") {
            match level.as_str() {
                "quiet" => self.quiet = true,
                "verbose" | "debug" => self.verbose = true,
                _ => {}
            }
        }

        if let Ok(host) = std::env::var("IMAGE_FETCHER_REGISTRY_HOST") {
            let auth = match (
                std::env::var("IMAGE_FETCHER_REGISTRY_USERNAME"),
                std::env::var("IMAGE_FETCHER_REGISTRY_PASSWORD"),
            ) {
                (Ok(u), Ok(p)) => Some(AuthConfig::new(u, p)),
                _ => None,
            };
            self.custom_registry = Some(RegistrySource::new("custom", &host).with_auth(auth));
        }

        self
    }

    /// Resolve a source name to a registry endpoint.
    ///
    /// Unknown sources are an `InvalidArgument`, surfaced synchronously at
    /// task creation.
    pub fn resolve_source(&self, name: &str) -> Result<RegistrySource> {
        match name {
            "dockerhub" => Ok(RegistrySource::new("dockerhub", "https://registry-1.docker.io")),
            "quay" => Ok(RegistrySource::new("quay", "https://quay.io")),
            "ghcr" => Ok(RegistrySource::new("ghcr", "https://ghcr.io")),
            "custom" => self.custom_registry.clone().ok_or_else(|| {
                FetcherError::InvalidArgument(
                    "source 'custom' requires IMAGE_FETCHER_REGISTRY_HOST".to_string(),
                )
            }),
            other => Err(FetcherError::InvalidArgument(format!(
                "unknown source: {}",
                other
            ))),
        }
    }
}

/// Normalize a repository path for a source. Docker Hub exposes official
/// images under the `library/` namespace, so a bare `nginx` means
/// `library/nginx`.
pub fn normalize_repository(source: &str, repository: &str) -> String {
    if source == "dockerhub" && !repository.contains('/') {
        format!("library/{}", repository)
    } else {
        repository.to_string()
    }
}
