//! Download engine: scheduler, state machine, progress bus and facade

pub mod control;
pub mod progress;
pub mod retry;
mod runner;
pub mod scheduler;

pub use control::{AbortToken, TaskControl};
pub use progress::{BusEvent, ProgressBus, Topic};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::Scheduler;

use crate::config::FetcherConfig;
use crate::error::{FetcherError, Result};
use crate::image::Platform;
use crate::logging::Logger;
use crate::registry::auth::Auth;
use crate::registry::{RegistryClient, RegistryClientBuilder, TokenManager};
use crate::task::{self, ImageCoordinate, Task, TaskStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Parameters for a new download task, as accepted at the API boundary.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub image_name: String,
    pub tag: Option<String>,
    pub source: String,
    pub target_path: Option<PathBuf>,
    pub platform: Option<String>,
}

/// The assembled engine: every component wired together once at startup
/// and passed around explicitly.
pub struct DownloadEngine {
    config: Arc<FetcherConfig>,
    store: Arc<TaskStore>,
    bus: Arc<ProgressBus>,
    client: Arc<RegistryClient>,
    scheduler: Arc<Scheduler>,
    output: Logger,
}

impl DownloadEngine {
    pub fn new(config: FetcherConfig) -> Result<Arc<Self>> {
        let output = if config.quiet {
            Logger::new_quiet()
        } else {
            Logger::new(config.verbose)
        };

        let config = Arc::new(config);
        let token_manager = Arc::new(TokenManager::new(
            Auth::new(reqwest::Client::new(), output.clone()),
            output.clone(),
        ));
        let client = Arc::new(RegistryClientBuilder::new(token_manager, output.clone()).build()?);
        let store = Arc::new(TaskStore::new(config.downloads_root.clone()));
        let bus = Arc::new(ProgressBus::new());
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&client),
            Arc::clone(&bus),
            Arc::clone(&config),
            output.clone(),
        );

        Ok(Arc::new(Self {
            config,
            store,
            bus,
            client,
            scheduler,
            output,
        }))
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Load persisted tasks and re-admit the interrupted ones. Returns how
    /// many tasks were recovered into the run queue.
    pub async fn recover(&self) -> Result<usize> {
        let runnable = self
            .store
            .load_from_disk(self.config.resume_on_start, &self.output)
            .await?;
        for id in &runnable {
            self.scheduler.enqueue(id).await;
        }
        Ok(runnable.len())
    }

    /// Validate a request, persist the new task and hand it to the
    /// scheduler.
    pub async fn create_task(&self, request: CreateRequest) -> Result<Task> {
        let image_name = request.image_name.trim();
        if image_name.is_empty() {
            return Err(FetcherError::InvalidArgument(
                "imageName must not be empty".to_string(),
            ));
        }
        // Validates the source synchronously; unknown sources never create
        // a task.
        self.config.resolve_source(&request.source)?;

        let repository = crate::config::normalize_repository(&request.source, image_name);
        let reference = request
            .tag
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or("latest")
            .to_string();
        let platform = match request.platform.as_deref() {
            Some(p) => p.parse::<Platform>()?,
            None => Platform::default(),
        };

        let id = task::new_task_id();
        let target_dir = match request.target_path {
            Some(base) => base.join(&id),
            None => task::default_target_dir(self.store.root(), &id),
        };

        let coord = ImageCoordinate {
            source: request.source,
            repository,
            reference,
        };
        self.output
            .info(&format!("Creating download task {} for {}", id, coord));

        let record = Task::new(id, coord, platform, target_dir);
        let record = self.store.create(record).await?;
        self.scheduler.enqueue(&record.id).await;
        Ok(record)
    }

    pub async fn list_tasks(&self) -> Vec<Task> {
        self.store.list().await
    }

    pub async fn inspect_task(&self, id: &str) -> Result<Task> {
        self.store.snapshot(id).await
    }

    pub async fn pause_task(&self, id: &str) -> Result<Task> {
        self.scheduler.pause(id).await
    }

    pub async fn resume_task(&self, id: &str) -> Result<Task> {
        self.scheduler.resume(id).await
    }

    pub async fn cancel_task(&self, id: &str) -> Result<Task> {
        self.scheduler.cancel(id).await
    }

    pub async fn retry_task(&self, id: &str) -> Result<Task> {
        self.scheduler.retry(id).await
    }

    pub async fn delete_task(&self, id: &str) -> Result<()> {
        self.scheduler.delete(id).await
    }

    /// Image size from manifests alone, for the size-probe endpoint.
    pub async fn probe_size(&self, source: &str, name: &str, tag: Option<&str>) -> Result<u64> {
        let registry = self.config.resolve_source(source)?;
        let repository = crate::config::normalize_repository(source, name.trim());
        let reference = tag.unwrap_or("latest");
        self.client
            .probe_size(&registry, &repository, reference, &Platform::default())
            .await
    }

    /// Subscribe to the event stream for a topic.
    pub fn subscribe(&self, topic: Topic) -> mpsc::Receiver<BusEvent> {
        self.bus.subscribe(topic)
    }

    /// Graceful shutdown: stop admissions, abort transfers, flush metadata.
    pub async fn shutdown(&self) {
        self.output.step("Shutting down download engine");
        self.scheduler.shutdown().await;
    }
}
