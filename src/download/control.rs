//! Cooperative cancellation for running tasks
//!
//! Each running task is registered with an abort token. Pause and cancel
//! trip the token; blob transfer loops check it after every network read,
//! so cancellation never depends on the network making progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Shared flag a transfer loop polls between reads.
#[derive(Debug, Clone, Default)]
pub struct AbortToken {
    flag: Arc<AtomicBool>,
}

impl AbortToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_tripped(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Registry of task id -> abort token for every task currently holding a
/// scheduler slot.
#[derive(Default)]
pub struct TaskControl {
    active: RwLock<HashMap<String, AbortToken>>,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running task; the returned token is passed into its
    /// transfer loops.
    pub fn register(&self, task_id: &str) -> AbortToken {
        let token = AbortToken::new();
        if let Ok(mut guard) = self.active.write() {
            guard.insert(task_id.to_string(), token.clone());
        }
        token
    }

    /// Drop the registration when the task leaves its slot. Only removes
    /// the entry if it still holds `token`: a resumed task may already have
    /// re-registered under the same id.
    pub fn unregister(&self, task_id: &str, token: &AbortToken) {
        if let Ok(mut guard) = self.active.write() {
            if let Some(current) = guard.get(task_id) {
                if Arc::ptr_eq(&current.flag, &token.flag) {
                    guard.remove(task_id);
                }
            }
        }
    }

    /// Trip the token for one task (pause/cancel verb).
    pub fn request_abort(&self, task_id: &str) {
        if let Ok(guard) = self.active.read() {
            if let Some(token) = guard.get(task_id) {
                token.trip();
            }
        }
    }

    /// Trip every registered token (graceful shutdown).
    pub fn abort_all(&self) {
        if let Ok(guard) = self.active.read() {
            for token in guard.values() {
                token.trip();
            }
        }
    }
}
