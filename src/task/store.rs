//! In-memory task index with a durable on-disk mirror
//!
//! The store is the single source of truth for task state. All mutation
//! goes through [`TaskStore::update`], which holds the per-task lock while
//! the mutator runs and then rewrites `metadata.json` via write-to-temp +
//! rename, so a crash mid-write never leaves a torn file. Byte counters may
//! be updated in memory only ([`TaskStore::update_ephemeral`]); on restart
//! the blob file lengths on disk are ground truth.

use crate::error::{FetcherError, Result};
use crate::logging::Logger;
use crate::task::{BlobState, Task, TaskState};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

pub struct TaskStore {
    root: PathBuf,
    tasks: RwLock<HashMap<String, Arc<Mutex<Task>>>>,
}

impl TaskStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn tasks_root(&self) -> PathBuf {
        self.root.join("tasks")
    }

    fn handle(&self, id: &str) -> Result<Arc<Mutex<Task>>> {
        let guard = self
            .tasks
            .read()
            .map_err(|_| FetcherError::Io("task index lock poisoned".to_string()))?;
        guard
            .get(id)
            .cloned()
            .ok_or_else(|| FetcherError::NotFound(format!("task {}", id)))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.read().map(|g| g.contains_key(id)).unwrap_or(false)
    }

    /// Insert a new task, create its on-disk directory and persist the
    /// initial record.
    pub async fn create(&self, task: Task) -> Result<Task> {
        tokio::fs::create_dir_all(task.blobs_dir()).await?;
        Self::write_metadata(&task).await?;

        let mut guard = self
            .tasks
            .write()
            .map_err(|_| FetcherError::Io("task index lock poisoned".to_string()))?;
        guard.insert(task.id.clone(), Arc::new(Mutex::new(task.clone())));
        Ok(task)
    }

    /// Clone the current record
    pub async fn snapshot(&self, id: &str) -> Result<Task> {
        let handle = self.handle(id)?;
        let task = handle.lock().await;
        Ok(task.clone())
    }

    /// All task records, ordered by creation time
    pub async fn list(&self) -> Vec<Task> {
        let handles: Vec<Arc<Mutex<Task>>> = match self.tasks.read() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(_) => return Vec::new(),
        };

        let mut tasks = Vec::with_capacity(handles.len());
        for handle in handles {
            tasks.push(handle.lock().await.clone());
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    /// Mutate a task under its lock and persist the new record atomically.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<Task>
    where
        F: FnOnce(&mut Task),
    {
        let handle = self.handle(id)?;
        let mut task = handle.lock().await;
        mutate(&mut task);
        task.updated_at = Utc::now();
        Self::write_metadata(&task).await?;
        Ok(task.clone())
    }

    /// Mutate a task in memory only. Used for byte counters between
    /// watermark persists; everything that changes states must go through
    /// [`TaskStore::update`].
    pub async fn update_ephemeral<F>(&self, id: &str, mutate: F) -> Result<Task>
    where
        F: FnOnce(&mut Task),
    {
        let handle = self.handle(id)?;
        let mut task = handle.lock().await;
        mutate(&mut task);
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    /// Flush the current in-memory record to disk.
    pub async fn persist(&self, id: &str) -> Result<Task> {
        let handle = self.handle(id)?;
        let task = handle.lock().await;
        Self::write_metadata(&task).await?;
        Ok(task.clone())
    }

    /// Remove a task from the index, optionally sweeping its directory.
    pub async fn remove(&self, id: &str, remove_files: bool) -> Result<()> {
        let handle = self.handle(id)?;
        let target_dir = {
            let task = handle.lock().await;
            task.target_dir.clone()
        };

        {
            let mut guard = self
                .tasks
                .write()
                .map_err(|_| FetcherError::Io("task index lock poisoned".to_string()))?;
            guard.remove(id);
        }

        if remove_files {
            match tokio::fs::remove_dir_all(&target_dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Load persisted tasks at startup and reconcile them against the blob
    /// files actually on disk.
    ///
    /// The metadata may be stale relative to the files (counters are only
    /// persisted on a watermark), so the file length wins: it becomes the
    /// blob's resumption offset, oversized partials are truncated, and
    /// `downloaded_bytes` is recomputed. Interrupted tasks come back as
    /// `Pending` (when `resume_active`) or `Paused`. Returns the ids that
    /// should be re-admitted to the scheduler.
    pub async fn load_from_disk(&self, resume_active: bool, output: &Logger) -> Result<Vec<String>> {
        let tasks_root = self.tasks_root();
        tokio::fs::create_dir_all(&tasks_root).await?;

        let mut runnable = Vec::new();
        let mut entries = tokio::fs::read_dir(&tasks_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata_path = entry.path().join("metadata.json");
            let raw = match tokio::fs::read(&metadata_path).await {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let mut task: Task = match serde_json::from_slice(&raw) {
                Ok(task) => task,
                Err(e) => {
                    output.warning(&format!(
                        "Skipping unreadable task metadata at {}: {}",
                        metadata_path.display(),
                        e
                    ));
                    continue;
                }
            };

            self.reconcile_blobs(&mut task).await?;

            if !task.state.is_terminal() {
                task.state = match task.state {
                    TaskState::Paused => TaskState::Paused,
                    _ if resume_active => TaskState::Pending,
                    _ => TaskState::Paused,
                };
                task.speed_bps = 0;
                if task.state == TaskState::Pending {
                    runnable.push(task.id.clone());
                }
            }

            output.verbose(&format!(
                "Recovered task {} ({}) in state {} with {} bytes",
                task.id, task.coord, task.state, task.downloaded_bytes
            ));

            Self::write_metadata(&task).await?;
            let mut guard = self
                .tasks
                .write()
                .map_err(|_| FetcherError::Io("task index lock poisoned".to_string()))?;
            guard.insert(task.id.clone(), Arc::new(Mutex::new(task)));
        }

        Ok(runnable)
    }

    async fn reconcile_blobs(&self, task: &mut Task) -> Result<()> {
        let mut downloaded = 0u64;
        for record in &mut task.blobs {
            let path = task.target_dir.join("blobs").join(record.file_name());
            let on_disk = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            };

            if record.size > 0 && on_disk > record.size {
                // Oversized partial cannot be trusted at any offset
                tokio::fs::remove_file(&path).await.ok();
                record.bytes_written = 0;
                record.state = BlobState::Missing;
            } else if record.state == BlobState::Done && on_disk == record.size {
                record.bytes_written = on_disk;
            } else {
                record.bytes_written = on_disk;
                record.state = BlobState::Missing;
            }
            downloaded += record.bytes_written;
        }
        if !task.blobs.is_empty() || task.downloaded_bytes > 0 {
            task.downloaded_bytes = downloaded;
        }
        Ok(())
    }

    async fn write_metadata(task: &Task) -> Result<()> {
        let path = task.metadata_path();
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(task)?;
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
