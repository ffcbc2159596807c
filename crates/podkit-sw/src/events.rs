//! Events delivered to a worker.

use bytes::Bytes;
use podkit_net::Request;

use crate::notification::Notification;

/// Install event. Handlers may request skip-waiting.
#[derive(Debug, Default)]
pub struct InstallEvent {
    skip_waiting: bool,
}

impl InstallEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate as soon as install finishes, without waiting for clients of
    /// the previous worker to close.
    pub fn skip_waiting(&mut self) {
        self.skip_waiting = true;
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting
    }
}

/// Activate event. Handlers may claim open clients.
#[derive(Debug, Default)]
pub struct ActivateEvent {
    claim: bool,
}

impl ActivateEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take control of in-scope clients once activation finishes.
    pub fn claim_clients(&mut self) {
        self.claim = true;
    }

    pub fn claim_requested(&self) -> bool {
        self.claim
    }
}

/// A fetch event.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub request: Request,

    /// Client that issued the request.
    pub client_id: Option<String>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
        }
    }
}

/// Background sync event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub tag: String,

    /// Set when the runtime will not retry this tag again.
    pub last_chance: bool,
}

impl SyncEvent {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            last_chance: false,
        }
    }
}

/// Push message event.
#[derive(Debug, Clone, Default)]
pub struct PushEvent {
    /// Raw payload, `None` when the push carried no data.
    pub data: Option<Bytes>,
}

impl PushEvent {
    pub fn new(data: Option<Bytes>) -> Self {
        Self { data }
    }

    /// Payload decoded as UTF-8 (lossy).
    pub fn text(&self) -> Option<String> {
        self.data
            .as_ref()
            .map(|d| String::from_utf8_lossy(d).into_owned())
    }
}

/// Notification click event.
#[derive(Debug, Clone)]
pub struct NotificationClickEvent {
    pub notification: Notification,

    /// Action button clicked, if any.
    pub action: Option<String>,
}
