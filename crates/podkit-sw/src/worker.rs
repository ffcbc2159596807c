//! Worker event handling.
//!
//! [`WorkerEventHandler`] is the seam between the runtime host and worker
//! logic: one method per event kind. [`PodcastWorker`] is the offline
//! worker for the podcast player.

use std::sync::Arc;

use async_trait::async_trait;
use podkit_net::{Fetcher, NetError, Response};
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::{Client, Clients};
use crate::config::WorkerConfig;
use crate::events::{
    ActivateEvent, FetchEvent, InstallEvent, NotificationClickEvent, PushEvent, SyncEvent,
};
use crate::notification::{Notification, NotificationOptions, Notifications};
use crate::policy::InterceptionPolicy;
use crate::sync::{NoopSync, SyncCollaborator};
use crate::Result;

/// Handles the events a runtime delivers to a worker.
#[async_trait]
pub trait WorkerEventHandler: Send + Sync {
    /// The returned future must settle before the worker counts as installed.
    async fn on_install(&self, event: &mut InstallEvent) -> Result<()>;

    async fn on_activate(&self, event: &mut ActivateEvent) -> Result<()>;

    /// Produce the response for an intercepted request.
    async fn on_fetch(&self, event: FetchEvent) -> std::result::Result<Response, NetError>;

    async fn on_sync(&self, event: SyncEvent) -> Result<()>;

    async fn on_push(&self, event: PushEvent) -> Result<Notification>;

    async fn on_notification_click(&self, event: NotificationClickEvent) -> Result<Client>;
}

/// Globals a worker sees: caches, clients, notifications and the network.
#[derive(Clone)]
pub struct WorkerScope {
    pub caches: CacheStorage,
    pub clients: Arc<RwLock<Clients>>,
    pub notifications: Arc<RwLock<Notifications>>,
    pub fetcher: Arc<dyn Fetcher>,
}

impl WorkerScope {
    /// Scope with in-memory caches and no clients.
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            caches: CacheStorage::new(),
            clients: Arc::new(RwLock::new(Clients::new())),
            notifications: Arc::new(RwLock::new(Notifications::new())),
            fetcher,
        }
    }

    pub fn with_caches(mut self, caches: CacheStorage) -> Self {
        self.caches = caches;
        self
    }
}

impl std::fmt::Debug for WorkerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerScope")
            .field("caches", &self.caches)
            .finish_non_exhaustive()
    }
}

/// Offline worker for the podcast player.
pub struct PodcastWorker {
    config: WorkerConfig,
    scope: WorkerScope,
    policy: InterceptionPolicy,
    sync: Arc<dyn SyncCollaborator>,
    click_url: Url,
}

impl PodcastWorker {
    pub fn new(config: WorkerConfig, scope: WorkerScope) -> Result<Self> {
        config.validate()?;
        let click_url = config.click_url()?;

        let policy = InterceptionPolicy::new(
            config.cache.clone(),
            config.origin.clone(),
            scope.caches.clone(),
            Arc::clone(&scope.fetcher),
        )
        .with_fetch_timeout(config.fetch_timeout());

        Ok(Self {
            config,
            scope,
            policy,
            sync: Arc::new(NoopSync),
            click_url,
        })
    }

    /// Replace the sync collaborator.
    pub fn with_sync(mut self, sync: Arc<dyn SyncCollaborator>) -> Self {
        self.sync = sync;
        self
    }

    pub fn policy(&self) -> &InterceptionPolicy {
        &self.policy
    }

    pub fn scope(&self) -> &WorkerScope {
        &self.scope
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn notification_options(&self, body: String) -> NotificationOptions {
        let n = &self.config.notification;
        NotificationOptions {
            body: Some(body),
            icon: n.icon.clone(),
            badge: n.badge.clone(),
            vibrate: n.vibrate.clone(),
            tag: None,
        }
    }
}

#[async_trait]
impl WorkerEventHandler for PodcastWorker {
    async fn on_install(&self, event: &mut InstallEvent) -> Result<()> {
        event.skip_waiting();
        self.policy.install().await?;
        Ok(())
    }

    async fn on_activate(&self, event: &mut ActivateEvent) -> Result<()> {
        let report = self.policy.activate().await;
        info!(
            generation = self.policy.generation(),
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Cache generations pruned"
        );
        event.claim_clients();
        Ok(())
    }

    async fn on_fetch(&self, event: FetchEvent) -> std::result::Result<Response, NetError> {
        self.policy.handle_fetch(event.request).await
    }

    async fn on_sync(&self, event: SyncEvent) -> Result<()> {
        if event.tag != self.config.sync_tag {
            debug!(tag = %event.tag, "Ignoring unknown sync tag");
            return Ok(());
        }
        self.sync.sync(&event.tag).await
    }

    async fn on_push(&self, event: PushEvent) -> Result<Notification> {
        let body = event
            .text()
            .unwrap_or_else(|| self.config.notification.default_body.clone());
        let options = self.notification_options(body);

        let notification = self
            .scope
            .notifications
            .write()
            .await
            .show(&self.config.notification.title, options);
        Ok(notification)
    }

    async fn on_notification_click(&self, event: NotificationClickEvent) -> Result<Client> {
        self.scope
            .notifications
            .write()
            .await
            .close(event.notification.id);

        self.scope
            .clients
            .write()
            .await
            .focus_or_open(self.click_url.clone())
    }
}

impl std::fmt::Debug for PodcastWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodcastWorker")
            .field("policy", &self.policy)
            .field("sync_tag", &self.config.sync_tag)
            .finish_non_exhaustive()
    }
}
