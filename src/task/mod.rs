//! Task model: the unit of download work and its blob records

pub mod store;

pub use store::TaskStore;

use crate::digest::DigestUtils;
use crate::error::FetcherError;
use crate::image::Platform;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Resolving,
    Fetching,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Terminal states never initiate further network activity
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "Pending",
            TaskState::Resolving => "Resolving",
            TaskState::Fetching => "Fetching",
            TaskState::Paused => "Paused",
            TaskState::Completed => "Completed",
            TaskState::Failed => "Failed",
            TaskState::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer state of one blob referenced by the selected manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobState {
    Missing,
    InProgress,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobRecord {
    pub digest: String,
    pub media_type: String,
    pub size: u64,
    pub state: BlobState,
    pub bytes_written: u64,
}

impl BlobRecord {
    pub fn new(digest: String, media_type: String, size: u64) -> Self {
        Self {
            digest,
            media_type,
            size,
            state: BlobState::Missing,
            bytes_written: 0,
        }
    }

    /// Portable on-disk file name under `blobs/`
    pub fn file_name(&self) -> String {
        DigestUtils::safe_file_name(&self.digest)
    }
}

/// `(source, repository, reference)` naming one image on one registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageCoordinate {
    pub source: String,
    pub repository: String,
    pub reference: String,
}

impl fmt::Display for ImageCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.source, self.repository, self.reference)
    }
}

/// Last fatal or transient error recorded on a task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub kind: String,
    pub message: String,
}

impl From<&FetcherError> for TaskError {
    fn from(err: &FetcherError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// The unit of work: one image being fetched into one on-disk directory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub coord: ImageCoordinate,
    pub platform: Platform,
    pub state: TaskState,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub speed_bps: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<TaskError>,
    pub retries: u32,
    pub target_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub blobs: Vec<BlobRecord>,
}

impl Task {
    pub fn new(
        id: String,
        coord: ImageCoordinate,
        platform: Platform,
        target_dir: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            coord,
            platform,
            state: TaskState::Pending,
            total_bytes: 0,
            downloaded_bytes: 0,
            speed_bps: 0,
            last_error: None,
            retries: 0,
            target_dir,
            checksum: None,
            created_at: now,
            updated_at: now,
            blobs: Vec::new(),
        }
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.target_dir.join("metadata.json")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.target_dir.join("manifest.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.target_dir.join("config.json")
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.target_dir.join("blobs")
    }

    pub fn blob_path(&self, record: &BlobRecord) -> PathBuf {
        self.blobs_dir().join(record.file_name())
    }

    /// Sum of `bytes_written` across blob records; must equal
    /// `downloaded_bytes` whenever no operation is in flight
    pub fn sum_blob_bytes(&self) -> u64 {
        self.blobs.iter().map(|b| b.bytes_written).sum()
    }

    pub fn all_blobs_done(&self) -> bool {
        !self.blobs.is_empty() && self.blobs.iter().all(|b| b.state == BlobState::Done)
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        ((self.downloaded_bytes as f64 / self.total_bytes as f64) * 100.0).min(100.0)
    }
}

/// Generate a random v4-style identifier for a new task.
pub fn new_task_id() -> String {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let mut bytes = [0u8; 16];
    rng.fill(&mut bytes);

    // Version 4 and RFC 4122 variant bits
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Target directory for a task under the downloads root.
pub fn default_target_dir(root: &Path, id: &str) -> PathBuf {
    root.join("tasks").join(id)
}
