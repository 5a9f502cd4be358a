//! Cancellable timers keyed by owner
//!
//! Every delayed action (snapshot clear, retry backoff, notification
//! auto-dismiss) is registered under a string key such as `clear:<id>`.
//! Scheduling under an existing key supersedes the previous timer.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::debug;

/// Key of the snapshot-clear timer for a transfer
#[must_use]
pub fn clear_key(transfer_id: &str) -> String {
    format!("clear:{transfer_id}")
}

/// Key of the retry timer for a transfer
#[must_use]
pub fn retry_key(transfer_id: &str) -> String {
    format!("retry:{transfer_id}")
}

/// Key of the auto-dismiss timer for a notification
#[must_use]
pub fn notification_key(notification_id: &str) -> String {
    format!("notification:{notification_id}")
}

#[derive(Debug)]
struct TimerEntry {
    generation: u64,
    handle: AbortHandle,
}

/// Registry of pending timers
///
/// Cloning yields another handle to the same registry.
#[derive(Debug, Clone, Default)]
pub struct TimerRegistry {
    timers: Arc<DashMap<String, TimerEntry>>,
    generation: Arc<AtomicU64>,
}

impl TimerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`, replacing any timer under `key`
    ///
    /// Returns false when called outside a tokio runtime, in which case
    /// nothing is scheduled.
    pub fn schedule<F>(&self, key: impl Into<String>, delay: Duration, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            debug!("No runtime available, timer not scheduled");
            return false;
        };

        let key = key.into();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        // Hold the slot while spawning so the task cannot observe a stale entry
        let slot = self.timers.entry(key.clone());

        let timers = Arc::clone(&self.timers);
        let task_key = key.clone();
        let join = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
            // Stays registered while running so teardown can still abort it
            timers.remove_if(&task_key, |_, entry| entry.generation == generation);
        });

        let entry = TimerEntry {
            generation,
            handle: join.abort_handle(),
        };
        match slot {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(entry);
                previous.handle.abort();
                debug!("Timer {} superseded, fires in {:?}", key, delay);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                debug!("Timer {} scheduled in {:?}", key, delay);
            }
        }
        true
    }

    /// Cancel the timer under `key`, returning true if one was pending
    pub fn cancel(&self, key: &str) -> bool {
        match self.timers.remove(key) {
            Some((_, entry)) => {
                entry.handle.abort();
                debug!("Timer {} cancelled", key);
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer
    pub fn cancel_all(&self) {
        let keys: Vec<String> = self.timers.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.cancel(&key);
        }
    }

    /// Returns true if a timer is pending or running under `key`
    #[must_use]
    pub fn is_scheduled(&self, key: &str) -> bool {
        self.timers.contains_key(key)
    }

    /// Number of pending timers
    #[must_use]
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Returns true if no timer is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}
