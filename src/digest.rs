//! SHA256 digest utilities for image content addressing
//!
//! Centralized functionality for computing, validating and formatting the
//! SHA256 digests used for manifests and blobs, and for turning digests
//! into portable file names.

use crate::error::{FetcherError, Result};
use sha2::Digest;

/// Utilities for working with SHA256 digests in registry context
pub struct DigestUtils;

impl DigestUtils {
    /// Compute SHA256 digest from byte data
    pub fn compute_sha256(data: &[u8]) -> String {
        let mut hasher = sha2::Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }

    /// Compute full registry digest (with sha256: prefix) from byte data
    pub fn compute_registry_digest(data: &[u8]) -> String {
        format!("sha256:{}", Self::compute_sha256(data))
    }

    /// Validate SHA256 hex string (64 characters, all hex)
    pub fn is_valid_sha256_hex(digest: &str) -> bool {
        digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit())
    }

    /// Validate full registry digest format (sha256:xxxxx)
    pub fn is_valid_registry_digest(digest: &str) -> bool {
        if let Some(hex_part) = digest.strip_prefix("sha256:") {
            Self::is_valid_sha256_hex(hex_part)
        } else {
            false
        }
    }

    /// Normalize digest to full registry format (add sha256: prefix if missing)
    pub fn normalize_digest(digest: &str) -> Result<String> {
        if let Some(hex_part) = digest.strip_prefix("sha256:") {
            if !Self::is_valid_sha256_hex(hex_part) {
                return Err(FetcherError::Protocol(format!(
                    "Invalid SHA256 digest: {}",
                    digest
                )));
            }
            Ok(digest.to_string())
        } else {
            if !Self::is_valid_sha256_hex(digest) {
                return Err(FetcherError::Protocol(format!(
                    "Invalid SHA256 digest: expected 64 hex characters, got '{}'",
                    digest
                )));
            }
            Ok(format!("sha256:{}", digest))
        }
    }

    /// Extract SHA256 hex part from full registry digest
    pub fn extract_hex_part(digest: &str) -> Result<&str> {
        match digest.strip_prefix("sha256:") {
            Some(hex_part) if Self::is_valid_sha256_hex(hex_part) => Ok(hex_part),
            Some(_) => Err(FetcherError::Protocol(format!(
                "Invalid SHA256 hex part in digest: {}",
                digest
            ))),
            None => Err(FetcherError::Protocol(format!(
                "Digest missing sha256: prefix: {}",
                digest
            ))),
        }
    }

    /// Verify data matches expected digest
    pub fn verify_data_integrity(data: &[u8], expected_digest: &str) -> Result<()> {
        let computed = Self::compute_sha256(data);
        let expected_hex = Self::extract_hex_part(expected_digest)?;

        if computed != expected_hex {
            return Err(FetcherError::Protocol(format!(
                "Digest mismatch: expected {}, computed sha256:{}",
                expected_digest, computed
            )));
        }

        Ok(())
    }

    /// File name for a digest, safe on any filesystem (`:` and `/` become `_`)
    pub fn safe_file_name(digest: &str) -> String {
        digest.replace([':', '/'], "_")
    }

    /// Format digest for display (truncated for readability)
    pub fn format_digest_short(digest: &str) -> String {
        if digest.len() > 23 {
            format!("{}...", &digest[..23])
        } else {
            digest.to_string()
        }
    }
}
