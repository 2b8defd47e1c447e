//! Two-level concurrency scheduler and external control verbs
//!
//! Tasks are admitted FIFO into a bounded set of slots; each running task
//! bounds its own blob transfers. The verbs (`pause`, `resume`, `cancel`,
//! `retry`, `delete`) mutate state synchronously and reach running
//! transfers through the abort-token registry, so cancellation never waits
//! on the network.

use crate::config::FetcherConfig;
use crate::download::control::TaskControl;
use crate::download::progress::ProgressBus;
use crate::download::retry::{RetryDecision, RetryPolicy};
use crate::download::runner::TaskRunner;
use crate::error::{FetcherError, Result};
use crate::logging::Logger;
use crate::registry::RegistryClient;
use crate::task::{Task, TaskError, TaskState, TaskStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

pub struct Scheduler {
    store: Arc<TaskStore>,
    bus: Arc<ProgressBus>,
    output: Logger,
    runner: TaskRunner,
    task_slots: Arc<Semaphore>,
    control: Arc<TaskControl>,
    retry_policy: RetryPolicy,
    shutting_down: AtomicBool,
    running: Mutex<JoinSet<()>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<TaskStore>,
        client: Arc<RegistryClient>,
        bus: Arc<ProgressBus>,
        config: Arc<FetcherConfig>,
        output: Logger,
    ) -> Arc<Self> {
        let runner = TaskRunner::new(
            Arc::clone(&store),
            client,
            Arc::clone(&bus),
            Arc::clone(&config),
            output.clone(),
        );
        Arc::new(Self {
            store,
            bus,
            output,
            runner,
            task_slots: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            control: Arc::new(TaskControl::new()),
            retry_policy: RetryPolicy::new(
                config.max_retries,
                config.retry_base_delay,
                config.retry_max_delay,
            ),
            shutting_down: AtomicBool::new(false),
            running: Mutex::new(JoinSet::new()),
        })
    }

    /// Hand a `Pending` task to the run queue. Admission order is the order
    /// of `enqueue` calls; the slot semaphore is fair.
    pub async fn enqueue(self: &Arc<Self>, id: &str) {
        if self.shutting_down.load(Ordering::Relaxed) {
            return;
        }
        let scheduler = Arc::clone(self);
        let id = id.to_string();
        let mut running = self.running.lock().await;
        running.spawn(async move {
            scheduler.execute(id).await;
        });
    }

    async fn execute(&self, id: String) {
        let permit = match Arc::clone(&self.task_slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return, // slots closed: shutting down
        };
        if self.shutting_down.load(Ordering::Relaxed) {
            return;
        }

        // Pause/cancel/delete may have landed while this task sat in the
        // queue; only a still-Pending task runs.
        match self.store.snapshot(&id).await {
            Ok(task) if task.state == TaskState::Pending => {}
            _ => return,
        }

        let abort = self.control.register(&id);
        self.bus.register_task(&id, abort.clone());

        loop {
            match self.runner.run_once(&id, abort.clone()).await {
                Ok(()) => break,
                Err(FetcherError::Cancelled) => {
                    // The verb (or shutdown) already wrote the state it
                    // wanted; the runner persisted the counters.
                    break;
                }
                Err(error) => {
                    let retries_used = self
                        .store
                        .snapshot(&id)
                        .await
                        .map(|t| t.retries)
                        .unwrap_or(u32::MAX);
                    let decision = self.retry_policy.decide(retries_used, &error);

                    if abort.is_tripped() || self.shutting_down.load(Ordering::Relaxed) {
                        // A verb (or shutdown) won the race against this
                        // failure; it already chose the state.
                        break;
                    }

                    match decision {
                        RetryDecision::RetryAfter(delay) => {
                            self.output.warning(&format!(
                                "Task {} attempt failed ({}), retrying in {}",
                                id,
                                error,
                                self.output.format_duration(delay)
                            ));
                            let _ = self
                                .store
                                .update(&id, |t| {
                                    t.retries += 1;
                                    t.last_error = Some(TaskError::from(&error));
                                })
                                .await;
                            tokio::time::sleep(delay).await;
                            if abort.is_tripped() || self.shutting_down.load(Ordering::Relaxed) {
                                break;
                            }
                        }
                        RetryDecision::NoRetry => {
                            self.output
                                .error(&format!("Task {} failed: {}", id, error));
                            let _ = self
                                .store
                                .update(&id, |t| {
                                    t.state = TaskState::Failed;
                                    t.last_error = Some(TaskError::from(&error));
                                    t.speed_bps = 0;
                                })
                                .await;
                            self.bus.flush(&id);
                            self.bus.error(&id, TaskError::from(&error));
                            break;
                        }
                    }
                }
            }
        }

        self.bus.deregister(&id);
        self.control.unregister(&id, &abort);
        drop(permit);
    }

    /// Pause a fetching task. Already-paused and completed tasks are a
    /// no-op success; anything else rejects the verb.
    pub async fn pause(&self, id: &str) -> Result<Task> {
        let task = self.store.snapshot(id).await?;
        match task.state {
            TaskState::Fetching => {
                // Trip first: once this returns, no further progress event
                // for the task is emitted. The mutation re-checks the state
                // so a completion that races the verb is not overwritten.
                self.control.request_abort(id);
                self.store
                    .update(id, |t| {
                        if t.state == TaskState::Fetching {
                            t.state = TaskState::Paused;
                            t.speed_bps = 0;
                        }
                    })
                    .await
            }
            TaskState::Paused | TaskState::Completed => Ok(task),
            other => Err(FetcherError::InvalidState(format!(
                "cannot pause task in state {}",
                other
            ))),
        }
    }

    /// Re-admit a paused task; it re-enters `Fetching` at the next
    /// scheduling opportunity using the saved blob offsets.
    pub async fn resume(self: &Arc<Self>, id: &str) -> Result<Task> {
        let task = self.store.snapshot(id).await?;
        match task.state {
            TaskState::Paused => {
                let task = self
                    .store
                    .update(id, |t| {
                        t.state = TaskState::Pending;
                    })
                    .await?;
                self.enqueue(id).await;
                Ok(task)
            }
            other => Err(FetcherError::InvalidState(format!(
                "cannot resume task in state {}",
                other
            ))),
        }
    }

    /// Cancel a task. Artifacts are retained; delete is a separate verb.
    pub async fn cancel(&self, id: &str) -> Result<Task> {
        let task = self.store.snapshot(id).await?;
        match task.state {
            TaskState::Pending
            | TaskState::Resolving
            | TaskState::Fetching
            | TaskState::Paused => {
                self.control.request_abort(id);
                self.store
                    .update(id, |t| {
                        if !t.state.is_terminal() {
                            t.state = TaskState::Cancelled;
                            t.speed_bps = 0;
                        }
                    })
                    .await
            }
            TaskState::Cancelled => Ok(task),
            other => Err(FetcherError::InvalidState(format!(
                "cannot cancel task in state {}",
                other
            ))),
        }
    }

    /// Re-admit a failed or cancelled task. The retry budget and error are
    /// reset; downloaded bytes are preserved so the retry resumes rather
    /// than restarts.
    pub async fn retry(self: &Arc<Self>, id: &str) -> Result<Task> {
        let task = self.store.snapshot(id).await?;
        match task.state {
            TaskState::Failed | TaskState::Cancelled => {
                let task = self
                    .store
                    .update(id, |t| {
                        t.state = TaskState::Pending;
                        t.retries = 0;
                        t.last_error = None;
                        t.checksum = None;
                        t.speed_bps = 0;
                    })
                    .await?;
                self.enqueue(id).await;
                Ok(task)
            }
            other => Err(FetcherError::InvalidState(format!(
                "cannot retry task in state {}",
                other
            ))),
        }
    }

    /// Remove a task and its on-disk artifacts. Active tasks must be
    /// paused or cancelled first.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let task = self.store.snapshot(id).await?;
        match task.state {
            TaskState::Resolving | TaskState::Fetching => {
                Err(FetcherError::InvalidState(format!(
                    "cannot delete task in state {}",
                    task.state
                )))
            }
            _ => {
                // A queued Pending task may still reach the front of the
                // queue; the tripped token and the missing record stop it.
                self.control.request_abort(id);
                self.store.remove(id, true).await
            }
        }
    }

    /// Stop admitting tasks, abort in-flight transfers and wait for the
    /// runners to flush their metadata.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        self.task_slots.close();
        self.control.abort_all();

        let mut running = self.running.lock().await;
        let drain = async {
            while running.join_next().await.is_some() {}
        };
        if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
            self.output
                .warning("Shutdown timed out waiting for running tasks");
            running.abort_all();
        }
    }
}
