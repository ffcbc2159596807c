//! # podkit Service Worker
//!
//! Offline worker for the podcast player: a cache-first request interception
//! policy with versioned cache generations, plus push-notification and
//! background-sync plumbing.
//!
//! ## Features
//!
//! - **Precache**: install fetches the whole manifest into the current
//!   generation, all or nothing
//! - **Generation GC**: activate deletes every generation but the current one
//! - **Cache-first fetch**: hits are served verbatim; successful `basic`/`cors`
//!   misses are written back in the background
//! - **Notifications**: push payload (or a default text) is shown; clicks open
//!   the application root
//! - **Sync hook**: an external collaborator runs on the `sync-podcasts` tag
//!
//! ## Architecture
//!
//! ```text
//! WorkerRuntime (lifecycle, dispatch)
//!     │
//!     └── WorkerEventHandler (PodcastWorker)
//!             ├── InterceptionPolicy ── CacheStorage ── Cache (generation)
//!             │         └── Fetcher (network)
//!             ├── Notifications
//!             ├── Clients
//!             └── SyncCollaborator
//! ```

use podkit_common::PodkitError;
use podkit_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod events;
pub mod notification;
mod persist;
pub mod policy;
pub mod runtime;
pub mod sync;
pub mod worker;

pub use cache::{CacheEntry, CacheHandle, CacheStorage, CachedResponse, StoredHeader};
pub use clients::{Client, ClientMatchOptions, ClientType, Clients};
pub use config::{CacheConfig, NotificationConfig, WorkerConfig};
pub use events::{
    ActivateEvent, FetchEvent, InstallEvent, NotificationClickEvent, PushEvent, SyncEvent,
};
pub use notification::{Notification, NotificationId, NotificationOptions, Notifications};
pub use policy::{ActivationReport, InterceptionPolicy};
pub use runtime::{
    FetchDisposition, RuntimeEvent, ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration,
    ServiceWorkerState, WorkerRuntime,
};
pub use sync::{NoopSync, SyncCollaborator};
pub use worker::{PodcastWorker, WorkerEventHandler, WorkerScope};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Precache of {url} failed: {reason}")]
    Precache { url: String, reason: String },

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Sync failed: {0}")]
    Sync(String),

    #[error(transparent)]
    Common(#[from] PodkitError),
}

impl ServiceWorkerError {
    /// Whether running the failed step again could succeed. Configuration
    /// mistakes and internal bugs will not fix themselves.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceWorkerError::Config(_) => false,
            ServiceWorkerError::Common(e) => e.is_retryable(),
            _ => true,
        }
    }

    /// Short label for the `category` log field.
    pub fn category(&self) -> &'static str {
        match self {
            ServiceWorkerError::InstallFailed(_) => "install",
            ServiceWorkerError::Precache { .. } => "precache",
            ServiceWorkerError::Network(_) => "network",
            ServiceWorkerError::StateError(_) => "state",
            ServiceWorkerError::CacheError(_) => "cache",
            ServiceWorkerError::Config(_) => "config",
            ServiceWorkerError::NotFound(_) => "not_found",
            ServiceWorkerError::Sync(_) => "sync",
            ServiceWorkerError::Common(e) => e.category(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceWorkerError>;
