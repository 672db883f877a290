//! Notifications: short-lived notices (reminders, connection loss) shown beside the
//! conversation. Entries expire after a TTL unless dismissed first.

use crate::protocol::{EventKind, ServerEvent};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Events the router consumes.
pub const NOTIFICATION_EVENTS: &[EventKind] = &[EventKind::Alert, EventKind::Disconnected];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Reminder,
    Connection,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: u64,
    pub title: String,
    pub kind: NotificationKind,
    pub created_at: DateTime<Utc>,
}

struct Entry {
    notification: Notification,
    /// Monotonic clock for expiry; `created_at` is for display.
    born: Instant,
}

/// The live list of notices, newest first.
pub struct NotificationCenter {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    ttl: Duration,
    revision: watch::Sender<u64>,
}

impl NotificationCenter {
    pub fn new(ttl: Duration) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            ttl,
            revision,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Change notifications; the value is a revision counter.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn push(&self, title: impl Into<String>, kind: NotificationKind) -> Notification {
        let notification = Notification {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            title: title.into(),
            kind,
            created_at: Utc::now(),
        };
        self.entries().insert(
            0,
            Entry {
                notification: notification.clone(),
                born: Instant::now(),
            },
        );
        self.revision.send_modify(|r| *r += 1);
        log::debug!("notice {} ({:?}): {}", notification.id, kind, notification.title);
        notification
    }

    /// Remove a notice now, whatever its age. Returns whether it was present.
    pub fn dismiss(&self, id: u64) -> bool {
        let removed = {
            let mut entries = self.entries();
            let before = entries.len();
            entries.retain(|e| e.notification.id != id);
            entries.len() != before
        };
        if removed {
            self.revision.send_modify(|r| *r += 1);
        }
        removed
    }

    /// Unexpired notices, newest first.
    pub fn active(&self) -> Vec<Notification> {
        let now = Instant::now();
        self.entries()
            .iter()
            .filter(|e| !self.expired(e, now))
            .map(|e| e.notification.clone())
            .collect()
    }

    /// Drop notices older than the TTL. Returns how many were removed.
    pub fn prune(&self, now: Instant) -> usize {
        let removed = {
            let mut entries = self.entries();
            let before = entries.len();
            entries.retain(|e| !self.expired(e, now));
            before - entries.len()
        };
        if removed > 0 {
            self.revision.send_modify(|r| *r += 1);
        }
        removed
    }

    /// Stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expired(&self, entry: &Entry, now: Instant) -> bool {
        now.saturating_duration_since(entry.born) >= self.ttl
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Turns channel events into notices. Never touches the conversation.
pub struct NotificationRouter {
    center: Arc<NotificationCenter>,
}

impl NotificationRouter {
    pub fn new(center: Arc<NotificationCenter>) -> Self {
        Self { center }
    }

    pub async fn run(self, mut events: mpsc::UnboundedReceiver<ServerEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                }
            }
        }
        log::debug!("notification router stopped");
    }

    pub fn handle(&self, event: ServerEvent) {
        match event {
            ServerEvent::Alert { title } => {
                self.center.push(title, NotificationKind::Reminder);
            }
            ServerEvent::Disconnected { reason } => {
                self.center
                    .push(format!("Connection lost: {}", reason), NotificationKind::Connection);
            }
            _ => {}
        }
    }
}

/// Periodically prune expired notices until `cancel` fires.
pub fn spawn_sweeper(
    center: Arc<NotificationCenter>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                now = ticker.tick() => {
                    let removed = center.prune(now);
                    if removed > 0 {
                        log::debug!("swept {} expired notice(s)", removed);
                    }
                }
            }
        }
    })
}
