//! Notifications shown by the worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::debug;

/// Unique identifier for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationId(u64);

impl NotificationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Options for `showNotification()`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationOptions {
    pub body: Option<String>,
    pub icon: Option<String>,
    pub badge: Option<String>,
    /// Vibration pattern in milliseconds.
    pub vibrate: Vec<u32>,
    /// Notifications sharing a tag replace each other.
    pub tag: Option<String>,
}

/// A displayed notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub options: NotificationOptions,
    pub shown_at: Instant,
}

impl Notification {
    pub fn body(&self) -> Option<&str> {
        self.options.body.as_deref()
    }
}

/// Notifications currently displayed for the registration.
#[derive(Debug, Default)]
pub struct Notifications {
    shown: Vec<Notification>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Display a notification, replacing any with the same tag.
    pub fn show(&mut self, title: &str, options: NotificationOptions) -> Notification {
        if let Some(tag) = &options.tag {
            self.shown
                .retain(|n| n.options.tag.as_deref() != Some(tag.as_str()));
        }

        let notification = Notification {
            id: NotificationId::new(),
            title: title.to_string(),
            options,
            shown_at: Instant::now(),
        };
        debug!(id = ?notification.id, title, "Showing notification");
        self.shown.push(notification.clone());
        notification
    }

    /// Close a notification. Returns whether it was still displayed.
    pub fn close(&mut self, id: NotificationId) -> bool {
        let before = self.shown.len();
        self.shown.retain(|n| n.id != id);
        before != self.shown.len()
    }

    /// Displayed notifications, optionally filtered by tag.
    pub fn get_notifications(&self, tag: Option<&str>) -> Vec<&Notification> {
        self.shown
            .iter()
            .filter(|n| tag.is_none() || n.options.tag.as_deref() == tag)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shown.is_empty()
    }
}
