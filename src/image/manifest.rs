//! Manifest parsing and platform selection
//!
//! Covers the four document types a registry can return for a manifest GET:
//! Docker v2 manifest, Docker manifest list, OCI image manifest and OCI
//! image index. Lists and indexes are resolved to a concrete per-platform
//! manifest digest before any blob is touched.

use crate::error::{FetcherError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Accept header sent on every manifest GET, covering all four types in a
/// single request.
pub const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    DockerManifest,
    DockerManifestList,
    OciManifest,
    OciIndex,
    Unknown,
}

impl ManifestKind {
    pub fn from_media_type(media_type: &str) -> Self {
        // Strip any parameters like `; charset=utf-8`
        let media_type = media_type.split(';').next().unwrap_or("").trim();
        match media_type {
            DOCKER_MANIFEST => ManifestKind::DockerManifest,
            DOCKER_MANIFEST_LIST => ManifestKind::DockerManifestList,
            OCI_MANIFEST => ManifestKind::OciManifest,
            OCI_INDEX => ManifestKind::OciIndex,
            _ => ManifestKind::Unknown,
        }
    }

    /// Whether this document points at other manifests rather than blobs
    pub fn is_index(&self) -> bool {
        matches!(self, ManifestKind::DockerManifestList | ManifestKind::OciIndex)
    }
}

/// `(os, architecture[, variant])` selector used against a manifest list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            variant: None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(variant) => write!(f, "{}/{}/{}", self.os, self.architecture, variant),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

impl FromStr for Platform {
    type Err = FetcherError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(os), Some(arch), variant, None) if !os.is_empty() && !arch.is_empty() => {
                Ok(Platform {
                    os: os.to_string(),
                    architecture: arch.to_string(),
                    variant: variant.map(|v| v.to_string()),
                })
            }
            _ => Err(FetcherError::InvalidArgument(format!(
                "invalid platform: {}",
                s
            ))),
        }
    }
}

/// A content descriptor: one config or layer entry in a manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: String,
}

/// A concrete image manifest enumerating the config blob and layer blobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Sum of config and layer sizes; the task's `total_bytes`
    pub fn total_bytes(&self) -> u64 {
        self.config.size + self.layers.iter().map(|l| l.size).sum::<u64>()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformDescriptor {
    pub os: String,
    pub architecture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub media_type: String,
    pub size: u64,
    pub digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformDescriptor>,
}

/// A manifest list / OCI index selecting one of several per-platform manifests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestIndex {
    pub schema_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<IndexEntry>,
}

pub fn parse_manifest(bytes: &[u8]) -> Result<ImageManifest> {
    serde_json::from_slice(bytes)
        .map_err(|e| FetcherError::Protocol(format!("unparsable image manifest: {}", e)))
}

pub fn parse_index(bytes: &[u8]) -> Result<ManifestIndex> {
    serde_json::from_slice(bytes)
        .map_err(|e| FetcherError::Protocol(format!("unparsable manifest index: {}", e)))
}

/// Pick the digest of the index entry matching `platform`.
///
/// Tie-break order: exact `(os, architecture, variant)` match, then same
/// architecture on any OS, then the first entry. An empty index is a
/// `NotFound` for the requested platform.
pub fn select_platform(index: &ManifestIndex, platform: &Platform) -> Result<String> {
    if index.manifests.is_empty() {
        return Err(FetcherError::NotFound(format!(
            "manifest list has no entry for platform {}",
            platform
        )));
    }

    let exact = index.manifests.iter().find(|entry| {
        entry.platform.as_ref().is_some_and(|p| {
            p.os == platform.os
                && p.architecture == platform.architecture
                && (platform.variant.is_none() || p.variant == platform.variant)
        })
    });
    if let Some(entry) = exact {
        return Ok(entry.digest.clone());
    }

    let same_arch = index
        .manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|p| p.architecture == platform.architecture)
        });
    if let Some(entry) = same_arch {
        return Ok(entry.digest.clone());
    }

    Ok(index.manifests[0].digest.clone())
}
