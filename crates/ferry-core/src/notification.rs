//! User-facing notifications
//!
//! Components publish through the [`Notifier`] trait; the
//! [`NotificationDispatcher`] keeps a capped, most-recent-first list and
//! publishes it on a `watch` channel. Non-persistent notifications are
//! dismissed automatically after their duration.

use crate::timers::{TimerRegistry, notification_key};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Default number of visible notifications
pub const DEFAULT_NOTIFICATION_CAP: usize = 5;

/// Default auto-dismiss delay
pub const DEFAULT_NOTIFICATION_DURATION: Duration = Duration::from_millis(5000);

/// Severity of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    /// Informational
    Info,
    /// Something succeeded
    Success,
    /// Needs attention
    Warning,
    /// Something failed
    Error,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Success => write!(f, "success"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A published notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Unique id (`notification-N`)
    pub id: String,
    /// Short title
    pub title: String,
    /// Body text
    pub message: String,
    /// Severity
    pub kind: NotificationKind,
    /// Never auto-dismissed when true
    pub persistent: bool,
    /// Publication time
    pub created_at: DateTime<Utc>,
}

/// What a component asks to publish
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    /// Short title
    pub title: String,
    /// Body text
    pub message: String,
    /// Severity
    pub kind: NotificationKind,
    /// Never auto-dismissed when true
    pub persistent: bool,
    /// Overrides the dispatcher's default auto-dismiss delay
    pub duration: Option<Duration>,
}

impl NotificationRequest {
    /// New non-persistent request
    #[must_use]
    pub fn new(kind: NotificationKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            kind,
            persistent: false,
            duration: None,
        }
    }

    /// Informational request
    #[must_use]
    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Info, title, message)
    }

    /// Success request
    #[must_use]
    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Success, title, message)
    }

    /// Warning request
    #[must_use]
    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Warning, title, message)
    }

    /// Error request
    #[must_use]
    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Error, title, message)
    }

    /// Keep the notification until dismissed
    #[must_use]
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Override the auto-dismiss delay
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// Publishing side used by the state machine and other components
pub trait Notifier: Send + Sync {
    /// Publish a notification, returning its id
    fn notify(&self, request: NotificationRequest) -> String;

    /// Remove a notification, returning true if it was visible
    fn dismiss(&self, id: &str) -> bool;
}

#[derive(Debug)]
struct Shared {
    tx: watch::Sender<Vec<Notification>>,
    timers: TimerRegistry,
    next_id: AtomicU64,
    cap: usize,
    default_duration: Duration,
}

impl Shared {
    fn dismiss(&self, id: &str) -> bool {
        self.timers.cancel(&notification_key(id));
        self.remove(id)
    }

    // Leaves the timer alone; the auto-dismiss task calls this on itself
    fn remove(&self, id: &str) -> bool {
        self.tx.send_if_modified(|list| {
            let before = list.len();
            list.retain(|n| n.id != id);
            list.len() != before
        })
    }
}

/// Capped notification list with auto-dismiss
///
/// Cloning yields another handle to the same list.
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    shared: Arc<Shared>,
}

impl Default for NotificationDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFICATION_CAP, DEFAULT_NOTIFICATION_DURATION)
    }
}

impl NotificationDispatcher {
    /// Create a dispatcher keeping at most `cap` notifications
    #[must_use]
    pub fn new(cap: usize, default_duration: Duration) -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self {
            shared: Arc::new(Shared {
                tx,
                timers: TimerRegistry::new(),
                next_id: AtomicU64::new(1),
                cap: cap.max(1),
                default_duration,
            }),
        }
    }

    /// Subscribe to the visible list
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<Notification>> {
        self.shared.tx.subscribe()
    }

    /// Copy of the visible list, most recent first
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.shared.tx.borrow().clone()
    }

    /// Number of visible notifications
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.tx.borrow().len()
    }

    /// Returns true if nothing is visible
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every notification
    pub fn clear(&self) {
        self.shared.timers.cancel_all();
        self.shared.tx.send_if_modified(|list| {
            let changed = !list.is_empty();
            list.clear();
            changed
        });
    }

    /// Cancel every auto-dismiss timer, leaving the list as is
    pub fn shutdown(&self) {
        self.shared.timers.cancel_all();
        debug!("Notification dispatcher shut down");
    }

    fn arm_auto_dismiss(&self, id: &str, duration: Duration) {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let task_id = id.to_string();
        self.shared
            .timers
            .schedule(notification_key(id), duration, async move {
                if let Some(shared) = weak.upgrade() {
                    shared.remove(&task_id);
                }
            });
    }
}

impl Notifier for NotificationDispatcher {
    fn notify(&self, request: NotificationRequest) -> String {
        let id = format!(
            "notification-{}",
            self.shared.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let notification = Notification {
            id: id.clone(),
            title: request.title,
            message: request.message,
            kind: request.kind,
            persistent: request.persistent,
            created_at: Utc::now(),
        };
        debug!(
            "Notification {} [{}]: {}",
            id, notification.kind, notification.title
        );

        let mut evicted = Vec::new();
        let cap = self.shared.cap;
        self.shared.tx.send_modify(|list| {
            list.insert(0, notification);
            if list.len() > cap {
                evicted = list.split_off(cap);
            }
        });
        for old in evicted {
            self.shared.timers.cancel(&notification_key(&old.id));
        }

        if !request.persistent {
            let duration = request.duration.unwrap_or(self.shared.default_duration);
            if !duration.is_zero() {
                self.arm_auto_dismiss(&id, duration);
            }
        }
        id
    }

    fn dismiss(&self, id: &str) -> bool {
        self.shared.dismiss(id)
    }
}
