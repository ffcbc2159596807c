//! Worker configuration.
//!
//! The generation id and precache manifest are supplied by build/deploy
//! tooling; nothing here is hardcoded into the policy itself.

use std::path::Path;

use podkit_common::{PodkitError, RetryConfig};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Result, ServiceWorkerError};

/// Cache generation and the assets it is seeded with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Version label naming the current generation.
    pub generation_id: String,

    /// URLs to precache on install, absolute or relative to the worker origin.
    pub manifest: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            generation_id: "podcast-pwa-v1".to_string(),
            manifest: [
                "/pod/",
                "/pod/index.html",
                "/pod/landscape.html",
                "/pod/manifest.json",
                "https://unpkg.com/react@18/umd/react.production.min.js",
                "https://unpkg.com/react-dom@18/umd/react-dom.production.min.js",
                "https://unpkg.com/@babel/standalone/babel.min.js",
                "https://cdn.jsdelivr.net/npm/@supabase/supabase-js@2",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl CacheConfig {
    pub fn new(generation_id: impl Into<String>, manifest: Vec<String>) -> Self {
        Self {
            generation_id: generation_id.into(),
            manifest,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.generation_id.trim().is_empty() {
            return Err(ServiceWorkerError::Config(
                "generation_id must not be empty".to_string(),
            ));
        }
        if let Some(pos) = self.manifest.iter().position(|u| u.trim().is_empty()) {
            return Err(ServiceWorkerError::Config(format!(
                "manifest entry {pos} is empty"
            )));
        }
        Ok(())
    }

    /// Resolve every manifest entry against `base`, preserving order.
    pub fn resolve_manifest(&self, base: &Url) -> Result<Vec<Url>> {
        self.manifest
            .iter()
            .map(|entry| {
                base.join(entry).map_err(|e| {
                    ServiceWorkerError::Config(format!("invalid manifest entry {entry:?}: {e}"))
                })
            })
            .collect()
    }
}

/// How push messages are presented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub title: String,
    /// Body used when a push arrives without a payload.
    pub default_body: String,
    pub icon: Option<String>,
    pub badge: Option<String>,
    /// Vibration pattern in milliseconds.
    pub vibrate: Vec<u32>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            title: "Podcast Player".to_string(),
            default_body: "New podcast episode available!".to_string(),
            icon: Some("icon-192.png".to_string()),
            badge: Some("icon-192.png".to_string()),
            vibrate: vec![200, 100, 200],
        }
    }
}

/// Complete worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the application is served from.
    pub origin: Url,

    /// Registration scope, relative to `origin`.
    pub scope: String,

    pub cache: CacheConfig,

    /// Background sync tag that triggers the sync collaborator.
    pub sync_tag: String,

    pub notification: NotificationConfig,

    /// Page opened when a notification is clicked, relative to `origin`.
    pub open_on_click: String,

    /// Give up on a cache-miss fetch after this long. `None` waits forever.
    pub fetch_timeout_ms: Option<u64>,

    pub install_retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("http://localhost/").expect("static URL is valid"),
            scope: "/pod/".to_string(),
            cache: CacheConfig::default(),
            sync_tag: "sync-podcasts".to_string(),
            notification: NotificationConfig::default(),
            open_on_click: "/".to_string(),
            fetch_timeout_ms: None,
            install_retry: RetryConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Default configuration for an application served from `origin`.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PodkitError::config_with_source("invalid worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            PodkitError::config_with_source(format!("cannot read {}", path.display()), e)
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.cache.resolve_manifest(&self.origin)?;
        if self.sync_tag.is_empty() {
            return Err(ServiceWorkerError::Config(
                "sync_tag must not be empty".to_string(),
            ));
        }
        self.scope_url()?;
        self.click_url()?;
        Ok(())
    }

    /// Absolute registration scope.
    pub fn scope_url(&self) -> Result<Url> {
        self.origin
            .join(&self.scope)
            .map_err(|e| ServiceWorkerError::Config(format!("invalid scope: {e}")))
    }

    /// Absolute URL opened on notification click.
    pub fn click_url(&self) -> Result<Url> {
        self.origin
            .join(&self.open_on_click)
            .map_err(|e| ServiceWorkerError::Config(format!("invalid open_on_click: {e}")))
    }

    pub fn fetch_timeout(&self) -> Option<std::time::Duration> {
        self.fetch_timeout_ms.map(std::time::Duration::from_millis)
    }
}
