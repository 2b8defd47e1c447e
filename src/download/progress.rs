//! Progress bus: byte-level aggregation and event fan-out
//!
//! Blob transfer loops push raw byte deltas; the bus owns the per-task
//! accounting (throughput EMA, throttling) and decides when and to whom an
//! event is delivered. Subscribers get their own bounded queue: a slow
//! consumer loses progress events, never terminal ones.

use crate::download::control::AbortToken;
use crate::task::TaskError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Minimum spacing between progress events per task
const EMIT_INTERVAL: Duration = Duration::from_millis(250);

/// Time constant of the throughput EMA, in seconds
const SPEED_TAU_SECS: f64 = 1.0;

/// Outbound queue depth per subscriber
const SUBSCRIBER_QUEUE: usize = 64;

/// Subscription scope: everything, or one task's events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Global,
    Task(String),
}

impl Topic {
    pub fn matches(&self, task_id: &str) -> bool {
        match self {
            Topic::Global => true,
            Topic::Task(id) => id == task_id,
        }
    }

    /// Parse a subscription topic name: `download:<task_id>` or `global`.
    pub fn parse(name: &str) -> Option<Topic> {
        if name.is_empty() || name == "global" {
            return Some(Topic::Global);
        }
        name.strip_prefix("download:")
            .filter(|id| !id.is_empty())
            .map(|id| Topic::Task(id.to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub task_id: String,
    /// 0..100
    pub progress: f64,
    /// Smoothed throughput in bytes per second
    pub speed: u64,
    /// Estimated seconds until completion, when the rate allows an estimate
    pub remaining_time: Option<u64>,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePayload {
    pub task_id: String,
    pub file_path: String,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub task_id: String,
    pub error: TaskError,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum BusEvent {
    #[serde(rename = "download:progress")]
    Progress(ProgressPayload),
    #[serde(rename = "download:complete")]
    Complete(CompletePayload),
    #[serde(rename = "download:error")]
    Error(ErrorPayload),
}

impl BusEvent {
    pub fn task_id(&self) -> &str {
        match self {
            BusEvent::Progress(p) => &p.task_id,
            BusEvent::Complete(p) => &p.task_id,
            BusEvent::Error(p) => &p.task_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BusEvent::Progress(_))
    }
}

struct TaskAccumulator {
    downloaded: u64,
    total: u64,
    speed: f64,
    last_sample: Instant,
    last_emit: Option<Instant>,
    abort: AbortToken,
}

impl TaskAccumulator {
    fn new(abort: AbortToken) -> Self {
        Self {
            downloaded: 0,
            total: 0,
            speed: 0.0,
            last_sample: Instant::now(),
            last_emit: None,
            abort,
        }
    }

    fn payload(&self, task_id: &str) -> ProgressPayload {
        let progress = if self.total > 0 {
            ((self.downloaded as f64 / self.total as f64) * 100.0).min(100.0)
        } else {
            0.0
        };
        let remaining = self.total.saturating_sub(self.downloaded);
        let remaining_time = if remaining == 0 {
            Some(0)
        } else if self.speed >= 1.0 {
            Some((remaining as f64 / self.speed).ceil() as u64)
        } else {
            None
        };
        ProgressPayload {
            task_id: task_id.to_string(),
            progress,
            speed: self.speed as u64,
            remaining_time,
            downloaded_bytes: self.downloaded,
            total_bytes: self.total,
        }
    }
}

struct Subscriber {
    topic: Topic,
    tx: mpsc::Sender<BusEvent>,
}

#[derive(Default)]
struct BusInner {
    subscribers: Vec<Subscriber>,
    tasks: HashMap<String, TaskAccumulator>,
}

/// Collects byte-level updates and fans events out to subscribers.
pub struct ProgressBus {
    inner: Mutex<BusInner>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner::default()),
        }
    }

    /// Open a subscription. The receiver sees every terminal event for its
    /// topic and a best-effort stream of progress events.
    pub fn subscribe(&self, topic: Topic) -> mpsc::Receiver<BusEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.push(Subscriber { topic, tx });
        rx
    }

    /// Start accounting for a task. The abort token gates emission: once it
    /// trips (pause/cancel), no further progress event leaves the bus.
    pub fn register_task(&self, task_id: &str, abort: AbortToken) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .tasks
            .insert(task_id.to_string(), TaskAccumulator::new(abort));
    }

    pub fn set_total(&self, task_id: &str, total: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(acc) = inner.tasks.get_mut(task_id) {
            acc.total = total;
        }
    }

    /// Seed the byte counter (resume or recovery baseline).
    pub fn set_downloaded(&self, task_id: &str, downloaded: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(acc) = inner.tasks.get_mut(task_id) {
            acc.downloaded = downloaded;
            acc.last_sample = Instant::now();
        }
    }

    /// Account a chunk of `delta` bytes for a task and emit a throttled
    /// progress event. Returns the current smoothed speed.
    pub fn record(&self, task_id: &str, delta: u64) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let Some(acc) = inner.tasks.get_mut(task_id) else {
            return 0;
        };

        let now = Instant::now();
        acc.downloaded += delta;

        let dt = now.duration_since(acc.last_sample).as_secs_f64();
        if dt > 1e-6 {
            let instantaneous = delta as f64 / dt;
            let alpha = 1.0 - (-dt / SPEED_TAU_SECS).exp();
            acc.speed += alpha * (instantaneous - acc.speed);
            acc.last_sample = now;
        }
        let speed = acc.speed as u64;

        let due = acc
            .last_emit
            .map_or(true, |at| now.duration_since(at) >= EMIT_INTERVAL);
        if due && !acc.abort.is_tripped() {
            acc.last_emit = Some(now);
            let event = BusEvent::Progress(acc.payload(task_id));
            Self::fanout(&mut inner, event);
        }

        speed
    }

    /// Take `removed` bytes back out of the counter. Happens when a server
    /// ignores a Range request and the blob restarts from zero.
    pub fn rewind(&self, task_id: &str, removed: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(acc) = inner.tasks.get_mut(task_id) {
            acc.downloaded = acc.downloaded.saturating_sub(removed);
        }
    }

    /// Emit the final pre-terminal progress update, bypassing the throttle.
    pub fn flush(&self, task_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(acc) = inner.tasks.get_mut(task_id) else {
            return;
        };
        if acc.abort.is_tripped() {
            return;
        }
        acc.last_emit = Some(Instant::now());
        let event = BusEvent::Progress(acc.payload(task_id));
        Self::fanout(&mut inner, event);
    }

    /// Terminal success event; never rate-limited, never dropped.
    pub fn complete(&self, task_id: &str, file_path: String, checksum: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.remove(task_id);
        let event = BusEvent::Complete(CompletePayload {
            task_id: task_id.to_string(),
            file_path,
            checksum,
        });
        Self::fanout(&mut inner, event);
    }

    /// Terminal failure event; never rate-limited, never dropped.
    pub fn error(&self, task_id: &str, error: TaskError) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.remove(task_id);
        let event = BusEvent::Error(ErrorPayload {
            task_id: task_id.to_string(),
            error,
        });
        Self::fanout(&mut inner, event);
    }

    /// Drop accounting for a task without emitting anything.
    pub fn deregister(&self, task_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.remove(task_id);
    }

    /// Current (downloaded, speed) view for a task.
    pub fn snapshot(&self, task_id: &str) -> Option<(u64, u64)> {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .get(task_id)
            .map(|acc| (acc.downloaded, acc.speed as u64))
    }

    fn fanout(inner: &mut BusInner, event: BusEvent) {
        let task_id = event.task_id().to_string();
        let terminal = event.is_terminal();

        inner.subscribers.retain(|subscriber| {
            if !subscriber.topic.matches(&task_id) {
                return true;
            }
            if terminal {
                // Guaranteed delivery to live subscribers: hand the send to
                // the runtime so a full queue cannot drop the event.
                let tx = subscriber.tx.clone();
                let event = event.clone();
                tokio::spawn(async move {
                    let _ = tx.send(event).await;
                });
                true
            } else {
                match subscriber.tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => true,
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            }
        });
    }
}
