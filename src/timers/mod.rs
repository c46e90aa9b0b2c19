//! The in-process timer registry.
//!
//! The registry holds one cancellable deferred fire per pending reminder, keyed by a namespaced
//! timer id. It is owned exclusively by the conductor of the leading process; non-leaders never
//! touch it, so no cross-process locking is needed. Timers do not execute side effects inline:
//! when a sleep elapses the timer posts its id back on the fires channel and the conductor
//! drives the actual commit + notify, keeping ordering and error propagation explicit.


use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::utils;

/// An in-process registry of pending fires, keyed by namespaced timer id.
pub struct TimerRegistry {
    /// The application's runtime config.
    config: Arc<Config>,
    /// All pending fires.
    timers: HashMap<String, JoinHandle<()>>,
    /// The sender side of the fires channel, cloned into each sleep task.
    fires_tx: mpsc::Sender<String>,
}

impl TimerRegistry {
    /// Create a new instance along with the receiver side of its fires channel.
    pub fn new(config: Arc<Config>) -> (Self, mpsc::Receiver<String>) {
        let (fires_tx, fires_rx) = mpsc::channel(1000);
        (
            Self {
                config,
                timers: HashMap::new(),
                fires_tx,
            },
            fires_rx,
        )
    }

    /// Schedule a fire for the given id at the given unix seconds timestamp.
    ///
    /// Registration is idempotent per id: scheduling an already registered id is a no-op, which
    /// guards duplicate recovery passes against double-fires. Fire times in the past are not
    /// scheduled (callers classify past events before reaching the registry), and fire times
    /// beyond the configured horizon are skipped and left for a later recovery pass.
    ///
    /// Returns `true` if a new timer was installed.
    pub fn schedule(&mut self, id: &str, fire_at: i64) -> bool {
        if self.timers.contains_key(id) {
            tracing::debug!(id, "timer already registered, skipping");
            return false;
        }
        let delay = fire_at - utils::now_unix();
        if delay <= 0 {
            tracing::debug!(id, fire_at, "fire time is not in the future, skipping");
            return false;
        }
        if delay > self.config.max_horizon() {
            tracing::debug!(id, fire_at, "fire time is beyond the scheduling horizon, deferred to a later recovery pass");
            return false;
        }
        let (tx, task_id) = (self.fires_tx.clone(), id.to_string());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(delay as u64)).await;
            let _ = tx.send(task_id).await;
        });
        self.timers.insert(id.to_string(), handle);
        true
    }

    /// Cancel the pending fire for the given id, if any.
    ///
    /// Returns `true` if a timer was cancelled.
    pub fn cancel(&mut self, id: &str) -> bool {
        match self.timers.remove(id) {
            Some(handle) => {
                handle.abort();
                tracing::debug!(id, "timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Remove the bookkeeping entry for a timer which has fired.
    pub fn remove(&mut self, id: &str) {
        self.timers.remove(id);
    }

    /// Check if the given id has a pending fire.
    pub fn contains(&self, id: &str) -> bool {
        self.timers.contains_key(id)
    }

    /// The number of pending fires.
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Abort all pending fires.
    ///
    /// Used when this process loses leadership: the new leader rebuilds its own registry from
    /// the store, and a demoted process must not fire stale timers.
    pub fn clear(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}
