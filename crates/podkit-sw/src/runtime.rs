//! Runtime host: registration lifecycle and event dispatch.
//!
//! The host owns one registration, drives a [`WorkerEventHandler`] through
//! install and activation, and routes fetch, sync, push and notification
//! events to the active worker. State changes are reported on an unbounded
//! channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use podkit_common::{retry_if, RetryConfig};
use podkit_net::{NetError, Request, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::{Client, Clients};
use crate::events::{
    ActivateEvent, FetchEvent, InstallEvent, NotificationClickEvent, PushEvent, SyncEvent,
};
use crate::notification::Notification;
use crate::worker::WorkerEventHandler;
use crate::{Result, ServiceWorkerError};

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Initial state, script parsed.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activate event running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, or install failed.
    Redundant,
}

// ==================== Service Worker ====================

/// A service worker instance.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    pub id: ServiceWorkerId,

    pub script_url: Url,

    pub state: ServiceWorkerState,

    /// Error message if install failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    pub fn new(script_url: Url) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            state: ServiceWorkerState::Parsed,
            error: None,
            state_changed_at: Instant::now(),
        }
    }

    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }
}

// ==================== Registration ====================

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active (or activating) worker.
    pub active: Option<ServiceWorker>,

    /// Last time a new script was installed.
    pub last_update_check: Option<Instant>,
}

impl ServiceWorkerRegistration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            last_update_check: None,
        }
    }

    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref().filter(|w| w.is_active())
    }

    /// Whether `url` falls under this registration.
    pub fn in_scope(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    /// Start installing a new worker. Any previous installing worker
    /// becomes redundant.
    pub fn begin_install(&mut self, script_url: Url) -> ServiceWorkerId {
        if let Some(mut previous) = self.installing.take() {
            previous.set_state(ServiceWorkerState::Redundant);
        }
        let mut worker = ServiceWorker::new(script_url);
        worker.set_state(ServiceWorkerState::Installing);
        let id = worker.id;
        self.installing = Some(worker);
        self.last_update_check = Some(Instant::now());
        id
    }

    /// Transition installing to waiting. A previously waiting worker is
    /// replaced.
    pub fn install_complete(&mut self) -> Option<ServiceWorkerId> {
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Installed);
        if let Some(mut replaced) = self.waiting.replace(worker) {
            replaced.set_state(ServiceWorkerState::Redundant);
        }
        self.waiting.as_ref().map(|w| w.id)
    }

    /// Discard the installing worker.
    pub fn install_failed(&mut self, error: String) -> Option<ServiceWorkerId> {
        let mut worker = self.installing.take()?;
        worker.error = Some(error);
        worker.set_state(ServiceWorkerState::Redundant);
        Some(worker.id)
    }

    /// Promote the waiting worker to active in the `Activating` state.
    /// Returns the new worker and the one it replaced.
    pub fn begin_activation(&mut self) -> Option<(ServiceWorkerId, Option<ServiceWorkerId>)> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activating);
        let id = worker.id;

        let replaced = self.active.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old.id
        });
        Some((id, replaced))
    }

    /// Mark the activating worker as activated.
    pub fn activation_complete(&mut self) {
        if let Some(worker) = self.active.as_mut() {
            worker.set_state(ServiceWorkerState::Activated);
        }
    }

    /// Unregister, marking every worker redundant.
    pub fn unregister(&mut self) {
        for slot in [&mut self.active, &mut self.waiting, &mut self.installing] {
            if let Some(mut worker) = slot.take() {
                worker.set_state(ServiceWorkerState::Redundant);
            }
        }
    }
}

// ==================== Runtime ====================

/// Runtime events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// A worker changed state.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A new worker started installing.
    UpdateFound { registration_scope: String },
    /// A client got a new controller.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

/// What the runtime did with a request.
#[derive(Debug)]
pub enum FetchDisposition {
    /// The active worker produced this outcome.
    Handled(std::result::Result<Response, NetError>),
    /// No worker controls the requester; go to the network directly.
    Passthrough(Request),
}

/// Hosts one registration and its worker.
pub struct WorkerRuntime {
    registration: RwLock<ServiceWorkerRegistration>,
    handler: Arc<dyn WorkerEventHandler>,
    clients: Arc<RwLock<Clients>>,
    install_retry: RetryConfig,
    event_tx: mpsc::UnboundedSender<RuntimeEvent>,
}

impl WorkerRuntime {
    /// `clients` should be the same list the handler's scope sees.
    pub fn new(
        scope: Url,
        handler: Arc<dyn WorkerEventHandler>,
        clients: Arc<RwLock<Clients>>,
        install_retry: RetryConfig,
    ) -> (Self, mpsc::UnboundedReceiver<RuntimeEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registration: RwLock::new(ServiceWorkerRegistration::new(scope)),
                handler,
                clients,
                install_retry,
                event_tx,
            },
            event_rx,
        )
    }

    fn emit(&self, event: RuntimeEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        debug!(worker = worker_id.raw(), state = ?new_state, "Worker state change");
        self.emit(RuntimeEvent::StateChange {
            worker_id,
            new_state,
        });
    }

    /// Install a worker script, retrying the install event with backoff.
    /// Errors that are not [`ServiceWorkerError::is_retryable`] fail at once.
    ///
    /// On success the worker is activated right away if it asked to skip
    /// waiting or nothing is active yet; otherwise it waits.
    pub async fn install(&self, script_url: Url) -> Result<ServiceWorkerId> {
        let id = {
            let mut registration = self.registration.write().await;
            let id = registration.begin_install(script_url);
            self.emit(RuntimeEvent::UpdateFound {
                registration_scope: registration.scope.to_string(),
            });
            id
        };
        self.emit_state(id, ServiceWorkerState::Installing);

        let handler = &self.handler;
        let outcome = retry_if(
            &self.install_retry,
            || async move {
                let mut event = InstallEvent::new();
                handler
                    .on_install(&mut event)
                    .await
                    .map(|()| event.skip_waiting_requested())
            },
            ServiceWorkerError::is_retryable,
        )
        .await;

        let skip_waiting = match outcome {
            Ok(skip) => skip,
            Err(e) => {
                warn!(worker = id.raw(), category = e.category(), error = %e, "Install failed");
                self.registration.write().await.install_failed(e.to_string());
                self.emit_state(id, ServiceWorkerState::Redundant);
                return Err(ServiceWorkerError::InstallFailed(e.to_string()));
            }
        };

        let nothing_active = {
            let mut registration = self.registration.write().await;
            registration.install_complete();
            registration.active.is_none()
        };
        self.emit_state(id, ServiceWorkerState::Installed);
        info!(worker = id.raw(), skip_waiting, "Worker installed");

        if skip_waiting || nothing_active {
            self.activate().await?;
        }
        Ok(id)
    }

    /// Activate the waiting worker.
    ///
    /// A failing activate handler is logged; the worker still becomes
    /// active.
    pub async fn activate(&self) -> Result<()> {
        let (id, replaced, scope) = {
            let mut registration = self.registration.write().await;
            let (id, replaced) = registration
                .begin_activation()
                .ok_or_else(|| ServiceWorkerError::StateError("No waiting worker".to_string()))?;
            (id, replaced, registration.scope.clone())
        };
        if let Some(old) = replaced {
            self.emit_state(old, ServiceWorkerState::Redundant);
        }
        self.emit_state(id, ServiceWorkerState::Activating);

        let mut event = ActivateEvent::new();
        if let Err(e) = self.handler.on_activate(&mut event).await {
            warn!(worker = id.raw(), error = %e, "Activate handler failed");
        }

        self.registration.write().await.activation_complete();
        self.emit_state(id, ServiceWorkerState::Activated);

        if event.claim_requested() {
            let claimed = self.clients.write().await.claim(id, &scope);
            debug!(worker = id.raw(), clients = claimed.len(), "Claimed clients");
            for client_id in claimed {
                self.emit(RuntimeEvent::ControllerChange {
                    client_id,
                    worker_id: id,
                });
            }
        }
        Ok(())
    }

    /// Load a page. In-scope pages are controlled by the active worker.
    pub async fn open_client(&self, url: Url) -> Client {
        let controller = {
            let registration = self.registration.read().await;
            registration
                .get_active()
                .filter(|_| registration.in_scope(&url))
                .map(|w| w.id)
        };

        let client = Client {
            controller,
            ..Client::window(url)
        };
        self.clients.write().await.add(client.clone());
        client
    }

    pub async fn remove_client(&self, id: &str) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    /// Route a request from `client_id`.
    ///
    /// Requests from controlled clients, and in-scope navigations, go to the
    /// active worker. Everything else passes through.
    pub async fn dispatch_fetch(&self, client_id: Option<&str>, request: Request) -> FetchDisposition {
        let Some(active) = self.active_worker_id().await else {
            return FetchDisposition::Passthrough(request);
        };

        let controlled = match client_id {
            Some(id) => self
                .clients
                .read()
                .await
                .get(id)
                .is_some_and(|c| c.controller == Some(active)),
            None => false,
        };
        let navigation_in_scope =
            request.is_navigation() && self.registration.read().await.in_scope(&request.url);

        if !controlled && !navigation_in_scope {
            return FetchDisposition::Passthrough(request);
        }

        let event = FetchEvent {
            request,
            client_id: client_id.map(str::to_string),
        };
        FetchDisposition::Handled(self.handler.on_fetch(event).await)
    }

    /// Deliver a background sync. An error means the sync should be retried.
    pub async fn dispatch_sync(&self, tag: &str, last_chance: bool) -> Result<()> {
        self.require_active().await?;
        self.handler
            .on_sync(SyncEvent {
                tag: tag.to_string(),
                last_chance,
            })
            .await
    }

    pub async fn dispatch_push(&self, data: Option<Bytes>) -> Result<Notification> {
        self.require_active().await?;
        self.handler.on_push(PushEvent::new(data)).await
    }

    /// Deliver a notification click. A window opened inside the scope is
    /// controlled by the active worker.
    pub async fn dispatch_notification_click(
        &self,
        notification: Notification,
        action: Option<String>,
    ) -> Result<Client> {
        let active = self.require_active().await?;
        let client = self
            .handler
            .on_notification_click(NotificationClickEvent {
                notification,
                action,
            })
            .await?;

        let scope = self.registration.read().await.scope.clone();
        if client.controller.is_none() && client.url.as_str().starts_with(scope.as_str()) {
            let mut clients = self.clients.write().await;
            if let Some(c) = clients.remove(&client.id) {
                let controlled = Client {
                    controller: Some(active),
                    ..c
                };
                clients.add(controlled.clone());
                return Ok(controlled);
            }
        }
        Ok(client)
    }

    /// Unregister, dropping every worker.
    pub async fn unregister(&self) {
        let ids: Vec<ServiceWorkerId> = {
            let mut registration = self.registration.write().await;
            let ids = [&registration.active, &registration.waiting, &registration.installing]
                .into_iter()
                .flatten()
                .map(|w| w.id)
                .collect();
            registration.unregister();
            ids
        };
        for id in ids {
            self.emit_state(id, ServiceWorkerState::Redundant);
        }
    }

    /// State of the newest worker in the registration.
    pub async fn state(&self) -> Option<ServiceWorkerState> {
        let registration = self.registration.read().await;
        registration
            .installing
            .as_ref()
            .or(registration.waiting.as_ref())
            .or(registration.active.as_ref())
            .map(|w| w.state)
    }

    pub async fn active_worker_id(&self) -> Option<ServiceWorkerId> {
        self.registration.read().await.get_active().map(|w| w.id)
    }

    pub async fn waiting_worker_id(&self) -> Option<ServiceWorkerId> {
        self.registration.read().await.waiting.as_ref().map(|w| w.id)
    }

    pub async fn scope(&self) -> Url {
        self.registration.read().await.scope.clone()
    }

    async fn require_active(&self) -> Result<ServiceWorkerId> {
        self.active_worker_id()
            .await
            .ok_or_else(|| ServiceWorkerError::StateError("No active worker".to_string()))
    }
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("install_retry", &self.install_retry)
            .finish_non_exhaustive()
    }
}
