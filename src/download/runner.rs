//! Per-task state machine: resolve the manifest chain, then stream blobs
//!
//! One call to [`TaskRunner::run_once`] is one attempt: `Resolving` (fetch
//! manifest, pick the platform entry, build the blob record set) followed
//! by `Fetching` (bounded-concurrency blob streaming with ranged
//! continuation and incremental SHA-256 verification). The scheduler owns
//! the retry loop around it; pause and cancel reach the transfer loops
//! through the abort token.

use crate::config::{FetcherConfig, RegistrySource};
use crate::digest::DigestUtils;
use crate::download::control::AbortToken;
use crate::download::progress::ProgressBus;
use crate::error::{FetcherError, Result};
use crate::logging::Logger;
use crate::registry::RegistryClient;
use crate::task::{BlobRecord, BlobState, TaskState, TaskStore};
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;

/// Byte counters are flushed to metadata whenever a blob accumulates this
/// much since its last persist.
const PERSIST_WATERMARK: u64 = 4 * 1024 * 1024;

pub(crate) struct TaskRunner {
    store: Arc<TaskStore>,
    client: Arc<RegistryClient>,
    bus: Arc<ProgressBus>,
    config: Arc<FetcherConfig>,
    output: Logger,
}

impl TaskRunner {
    pub fn new(
        store: Arc<TaskStore>,
        client: Arc<RegistryClient>,
        bus: Arc<ProgressBus>,
        config: Arc<FetcherConfig>,
        output: Logger,
    ) -> Self {
        Self {
            store,
            client,
            bus,
            config,
            output,
        }
    }

    /// One full pass: `Resolving` then `Fetching` then `Completed`.
    ///
    /// Returns `Cancelled` when the abort token tripped; any state the verb
    /// wanted (`Paused`, `Cancelled`) has already been written by then, so
    /// this path only persists counters and backs out.
    pub async fn run_once(&self, id: &str, abort: AbortToken) -> Result<()> {
        let task = self
            .store
            .update(id, |t| {
                // A verb may have flipped the state while this attempt was
                // queued or backing off; never overwrite its decision.
                if matches!(
                    t.state,
                    TaskState::Pending | TaskState::Resolving | TaskState::Fetching
                ) {
                    t.state = TaskState::Resolving;
                }
                t.speed_bps = 0;
            })
            .await?;
        if task.state != TaskState::Resolving {
            return Err(FetcherError::Cancelled);
        }

        let source = self.config.resolve_source(&task.coord.source)?;
        self.output.step(&format!(
            "Resolving {} for platform {}",
            task.coord, task.platform
        ));

        let resolved = self
            .client
            .resolve_manifest(
                &source,
                &task.coord.repository,
                &task.coord.reference,
                &task.platform,
            )
            .await?;
        if abort.is_tripped() {
            return Err(FetcherError::Cancelled);
        }

        // The selected manifest is kept verbatim; its digest becomes the
        // task checksum on completion.
        tokio::fs::write(task.manifest_path(), &resolved.manifest_bytes).await?;

        // The config blob is small and needed up front; it lands both as
        // config.json and under blobs/ like any other blob.
        let config_bytes = self
            .client
            .get_blob(&source, &task.coord.repository, &resolved.manifest.config.digest)
            .await?;
        if config_bytes.len() as u64 != resolved.manifest.config.size {
            return Err(FetcherError::Protocol(format!(
                "config blob size mismatch: manifest says {}, got {}",
                resolved.manifest.config.size,
                config_bytes.len()
            )));
        }
        tokio::fs::write(task.config_path(), &config_bytes).await?;

        let mut config_record = BlobRecord::new(
            resolved.manifest.config.digest.clone(),
            resolved.manifest.config.media_type.clone(),
            resolved.manifest.config.size,
        );
        tokio::fs::write(
            task.blobs_dir().join(config_record.file_name()),
            &config_bytes,
        )
        .await?;
        config_record.state = BlobState::Done;
        config_record.bytes_written = config_record.size;

        if abort.is_tripped() {
            return Err(FetcherError::Cancelled);
        }

        let mut records = Vec::with_capacity(resolved.manifest.layers.len() + 1);
        records.push(config_record);
        for layer in &resolved.manifest.layers {
            records.push(BlobRecord::new(
                layer.digest.clone(),
                layer.media_type.clone(),
                layer.size,
            ));
        }

        let total_bytes = resolved.manifest.total_bytes();
        let task = self
            .store
            .update(id, |t| {
                // Carry byte counts over from a previous attempt so resume
                // continues instead of restarting. Freshly fetched records
                // (the config) are already complete.
                for record in &mut records {
                    if record.state == BlobState::Done {
                        continue;
                    }
                    if let Some(prev) = t.blobs.iter().find(|b| b.digest == record.digest) {
                        record.bytes_written = prev.bytes_written;
                        if prev.state == BlobState::Done && prev.bytes_written == record.size {
                            record.state = BlobState::Done;
                        }
                    }
                }
                t.blobs = std::mem::take(&mut records);
                t.total_bytes = total_bytes;
                t.downloaded_bytes = t.sum_blob_bytes();
                t.checksum = None;
                t.last_error = None;
                if t.state == TaskState::Resolving {
                    t.state = TaskState::Fetching;
                }
            })
            .await?;
        if task.state != TaskState::Fetching {
            return Err(FetcherError::Cancelled);
        }

        self.bus.set_total(id, task.total_bytes);
        self.bus.set_downloaded(id, task.downloaded_bytes);
        self.output.verbose(&format!(
            "Fetching {} blobs ({})",
            task.blobs.len(),
            self.output.format_size(task.total_bytes)
        ));

        // One failed blob stops its siblings; the first real error wins.
        let failure = AbortToken::new();
        let slots = Arc::new(Semaphore::new(self.config.blobs_per_task));
        let mut handles = Vec::new();
        for (index, record) in task.blobs.iter().enumerate() {
            if record.state == BlobState::Done {
                continue;
            }
            // Acquiring the slot before spawning admits blobs in manifest
            // order.
            let permit = match Arc::clone(&slots).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let transfer = BlobTransfer {
                store: Arc::clone(&self.store),
                client: Arc::clone(&self.client),
                bus: Arc::clone(&self.bus),
                output: self.output.clone(),
                source: source.clone(),
                task_id: id.to_string(),
                repository: task.coord.repository.clone(),
                blob_index: index,
                digest: record.digest.clone(),
                size: record.size,
                path: task.blob_path(record),
                abort: abort.clone(),
                failure: failure.clone(),
            };
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                transfer.run().await
            }));
        }

        let mut first_error: Option<FetcherError> = None;
        for handle in futures::future::join_all(handles).await {
            match handle {
                Ok(Ok(())) => {}
                Ok(Err(FetcherError::Cancelled)) => {}
                Ok(Err(e)) => {
                    failure.trip();
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    failure.trip();
                    if first_error.is_none() {
                        first_error = Some(FetcherError::Io(format!("blob task panicked: {}", e)));
                    }
                }
            }
        }

        // Counters from interrupted siblings are worth keeping either way
        self.store.persist(id).await?;

        if let Some(error) = first_error {
            return Err(error);
        }
        if abort.is_tripped() {
            return Err(FetcherError::Cancelled);
        }

        let task = self.store.snapshot(id).await?;
        if !task.all_blobs_done() {
            return Err(FetcherError::Protocol(
                "fetch finished with incomplete blob records".to_string(),
            ));
        }

        self.bus.flush(id);
        let checksum = resolved.digest.clone();
        let mut completed_now = false;
        let completed = self
            .store
            .update(id, |t| {
                if t.state == TaskState::Fetching {
                    t.state = TaskState::Completed;
                    t.checksum = Some(checksum.clone());
                    t.downloaded_bytes = t.sum_blob_bytes();
                    t.speed_bps = 0;
                    completed_now = true;
                }
            })
            .await?;
        if !completed_now {
            return Err(FetcherError::Cancelled);
        }
        self.bus.complete(
            id,
            completed.target_dir.display().to_string(),
            resolved.digest,
        );
        self.output.success(&format!(
            "Completed {} ({})",
            completed.coord,
            self.output.format_size(completed.total_bytes)
        ));
        Ok(())
    }
}

/// Everything one blob stream needs, owned, so the transfer can run as its
/// own spawned task.
struct BlobTransfer {
    store: Arc<TaskStore>,
    client: Arc<RegistryClient>,
    bus: Arc<ProgressBus>,
    output: Logger,
    source: RegistrySource,
    task_id: String,
    repository: String,
    blob_index: usize,
    digest: String,
    size: u64,
    path: PathBuf,
    abort: AbortToken,
    failure: AbortToken,
}

impl BlobTransfer {
    fn stopped(&self) -> bool {
        self.abort.is_tripped() || self.failure.is_tripped()
    }

    async fn run(&self) -> Result<()> {
        if self.stopped() {
            return Err(FetcherError::Cancelled);
        }

        // The file length on disk is the resumption offset; the in-memory
        // record may be staler than the file.
        let mut offset = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if offset > self.size {
            tokio::fs::remove_file(&self.path).await.ok();
            offset = 0;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .await?;

        let mut hasher = Sha256::new();
        if offset > 0 {
            Self::seed_hasher(&mut hasher, &mut file, offset).await?;
        }

        // A full-length partial from an earlier attempt may already be the
        // whole blob; verify before touching the network.
        if offset == self.size {
            let computed = format!("{:x}", hasher.finalize_reset());
            if computed == DigestUtils::extract_hex_part(&self.digest)? {
                self.mark_done().await?;
                return Ok(());
            }
            self.output.warning(&format!(
                "Blob {} on disk fails verification, refetching",
                DigestUtils::format_digest_short(&self.digest)
            ));
            file.set_len(0).await?;
            file.seek(SeekFrom::Start(0)).await?;
            self.rewind_counters(offset).await?;
            offset = 0;
            hasher = Sha256::new();
        }

        self.store
            .update(&self.task_id, |t| {
                t.blobs[self.blob_index].state = BlobState::InProgress;
                t.blobs[self.blob_index].bytes_written = offset;
                t.downloaded_bytes = t.sum_blob_bytes();
            })
            .await?;

        let mut response = self
            .client
            .stream_blob(&self.source, &self.repository, &self.digest, offset)
            .await?;

        if offset > 0 && response.status().as_u16() != 206 {
            // Server ignored the Range request; restart the blob from zero
            self.output.verbose(&format!(
                "Server ignored range for blob {}, restarting from 0",
                DigestUtils::format_digest_short(&self.digest)
            ));
            file.set_len(0).await?;
            file.seek(SeekFrom::Start(0)).await?;
            self.rewind_counters(offset).await?;
            offset = 0;
            hasher = Sha256::new();
        } else if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }

        let mut written = offset;
        let mut last_persisted = written;
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    file.flush().await.ok();
                    self.park_blob(written).await;
                    return Err(FetcherError::Transport(format!(
                        "blob stream interrupted: {}",
                        e
                    )));
                }
            };

            if self.stopped() {
                file.flush().await.ok();
                self.park_blob(written).await;
                return Err(FetcherError::Cancelled);
            }

            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            written += chunk.len() as u64;

            let speed = self.bus.record(&self.task_id, chunk.len() as u64);
            self.store
                .update_ephemeral(&self.task_id, |t| {
                    t.blobs[self.blob_index].bytes_written = written;
                    t.downloaded_bytes = t.sum_blob_bytes();
                    t.speed_bps = speed;
                })
                .await?;

            if written - last_persisted >= PERSIST_WATERMARK {
                last_persisted = written;
                self.store.persist(&self.task_id).await?;
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        if written != self.size {
            self.park_blob(written).await;
            return Err(FetcherError::Transport(format!(
                "blob {} truncated: got {} of {} bytes",
                DigestUtils::format_digest_short(&self.digest),
                written,
                self.size
            )));
        }

        let computed = format!("{:x}", hasher.finalize());
        if computed != DigestUtils::extract_hex_part(&self.digest)? {
            self.park_blob(written).await;
            return Err(FetcherError::Protocol(format!(
                "blob digest mismatch: expected {}, computed sha256:{}",
                self.digest, computed
            )));
        }

        self.mark_done().await?;
        self.output.detail(&format!(
            "Blob {} done ({})",
            DigestUtils::format_digest_short(&self.digest),
            self.output.format_size(self.size)
        ));
        Ok(())
    }

    /// Re-reads an existing prefix through the hasher so verification stays
    /// incremental across resumes.
    async fn seed_hasher(
        hasher: &mut Sha256,
        file: &mut tokio::fs::File,
        offset: u64,
    ) -> Result<()> {
        file.seek(SeekFrom::Start(0)).await?;
        let mut remaining = offset;
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(FetcherError::Io(
                    "blob file shorter than its recorded offset".to_string(),
                ));
            }
            hasher.update(&buf[..n]);
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Leave an interrupted blob as a resumable partial: bytes kept, state
    /// back to `Missing`, record flushed to disk.
    async fn park_blob(&self, written: u64) {
        let _ = self
            .store
            .update(&self.task_id, |t| {
                t.blobs[self.blob_index].state = BlobState::Missing;
                t.blobs[self.blob_index].bytes_written = written;
                t.downloaded_bytes = t.sum_blob_bytes();
            })
            .await;
    }

    async fn rewind_counters(&self, removed: u64) -> Result<()> {
        self.bus.rewind(&self.task_id, removed);
        self.store
            .update_ephemeral(&self.task_id, |t| {
                t.blobs[self.blob_index].bytes_written = 0;
                t.downloaded_bytes = t.sum_blob_bytes();
            })
            .await?;
        Ok(())
    }

    async fn mark_done(&self) -> Result<()> {
        self.store
            .update(&self.task_id, |t| {
                t.blobs[self.blob_index].state = BlobState::Done;
                t.blobs[self.blob_index].bytes_written = self.size;
                t.downloaded_bytes = t.sum_blob_bytes();
            })
            .await?;
        Ok(())
    }
}
