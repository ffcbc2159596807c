//! Cache-first interception policy.
//!
//! Install seeds the current generation from the manifest, activate drops
//! every other generation, fetch answers from the cache when it can and
//! otherwise goes to the network, writing successful `basic`/`cors` 200s
//! back into the current generation in the background.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use podkit_common::{with_timeout, PodkitError};
use podkit_net::{Fetcher, NetError, Request, Response, ResponseType};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::cache::{CacheStorage, CachedResponse};
use crate::config::CacheConfig;
use crate::Result;

/// Outcome of [`InterceptionPolicy::activate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// Generation left in place.
    pub kept: Option<String>,
    /// Generations removed.
    pub deleted: Vec<String>,
    /// Generations that could not be removed, with the reason.
    pub failed: Vec<(String, String)>,
}

/// The cache-first policy bound to one generation.
pub struct InterceptionPolicy {
    config: CacheConfig,
    base_url: Url,
    caches: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    fetch_timeout: Option<Duration>,
    pending_writes: Mutex<Vec<JoinHandle<()>>>,
}

impl InterceptionPolicy {
    /// `base_url` resolves relative manifest entries.
    pub fn new(
        config: CacheConfig,
        base_url: Url,
        caches: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            config,
            base_url,
            caches,
            fetcher,
            fetch_timeout: None,
            pending_writes: Mutex::new(Vec::new()),
        }
    }

    /// Bound cache-miss fetches.
    pub fn with_fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Current generation id.
    pub fn generation(&self) -> &str {
        &self.config.generation_id
    }

    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    /// Precache the manifest into the current generation.
    ///
    /// Resolves only once every entry is stored. Any failure leaves the
    /// generation without the batch and fails the install.
    pub async fn install(&self) -> Result<usize> {
        let urls = self.config.resolve_manifest(&self.base_url)?;
        info!(
            generation = self.generation(),
            entries = urls.len(),
            "Precaching manifest"
        );

        let cache = self.caches.open(self.generation()).await;
        let requests = urls.into_iter().map(Request::get).collect();
        let stored = cache.add_all(self.fetcher.as_ref(), requests).await?;

        info!(generation = self.generation(), stored, "Precache complete");
        Ok(stored)
    }

    /// Delete every generation except the current one.
    ///
    /// Deletions run concurrently and are best-effort: a failure is logged
    /// and reported but does not stop the others.
    pub async fn activate(&self) -> ActivationReport {
        let current = self.generation().to_string();
        let stale: Vec<String> = self
            .caches
            .keys()
            .await
            .into_iter()
            .filter(|name| *name != current)
            .collect();

        let results = join_all(stale.iter().map(|name| async move {
            let outcome = self.caches.delete(name).await;
            (name.clone(), outcome)
        }))
        .await;

        let mut report = ActivationReport {
            kept: self.caches.has(&current).await.then_some(current),
            ..Default::default()
        };
        for (name, outcome) in results {
            match outcome {
                Ok(_) => {
                    info!(generation = %name, "Deleted stale cache generation");
                    report.deleted.push(name);
                }
                Err(e) => {
                    warn!(generation = %name, error = %e, "Failed to delete stale cache generation");
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        report
    }

    /// Answer an intercepted request.
    ///
    /// A failed live fetch is returned to the caller unchanged.
    pub async fn handle_fetch(&self, request: Request) -> std::result::Result<Response, NetError> {
        if let Some(hit) = self.caches.match_request(&request).await {
            trace!(url = %request.url, "Cache hit");
            return hit
                .to_response()
                .map_err(|e| NetError::RequestFailed(e.to_string()));
        }

        trace!(url = %request.url, "Cache miss");
        let response = self.fetch_live(request.clone()).await?;

        if !Self::is_cacheable(&response) {
            debug!(
                url = %request.url,
                status = response.status,
                response_type = %response.response_type,
                "Not caching response"
            );
            return Ok(response);
        }

        let response = response.buffered().await?;
        match CachedResponse::snapshot(&response) {
            Ok(snapshot) => self.spawn_write(request, snapshot).await,
            Err(e) => warn!(url = %request.url, error = %e, "Cannot snapshot response"),
        }
        Ok(response)
    }

    /// Only complete same-origin or CORS responses are kept.
    fn is_cacheable(response: &Response) -> bool {
        response.status == 200
            && matches!(
                response.response_type,
                ResponseType::Basic | ResponseType::Cors
            )
    }

    async fn fetch_live(&self, request: Request) -> std::result::Result<Response, NetError> {
        let fetcher = Arc::clone(&self.fetcher);
        match self.fetch_timeout {
            Some(timeout) => with_timeout(timeout, || async move { fetcher.fetch(request).await })
                .await
                .map_err(|e| match e {
                    PodkitError::Timeout(d) => NetError::Timeout(d),
                    other => NetError::RequestFailed(other.to_string()),
                })?,
            None => fetcher.fetch(request).await,
        }
    }

    async fn spawn_write(&self, request: Request, snapshot: CachedResponse) {
        let caches = self.caches.clone();
        let generation = self.generation().to_string();

        let handle = tokio::spawn(async move {
            let cache = caches.open(&generation).await;
            match cache.put(&request, snapshot).await {
                Ok(()) => trace!(url = %request.url, generation, "Cached response"),
                Err(e) => warn!(url = %request.url, error = %e, "Background cache write failed"),
            }
        });

        let mut pending = self.pending_writes.lock().await;
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Wait for every background cache write started so far.
    pub async fn flush_pending_writes(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.pending_writes.lock().await);
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Background cache write panicked");
            }
        }
    }
}

impl std::fmt::Debug for InterceptionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptionPolicy")
            .field("generation", &self.config.generation_id)
            .field("base_url", &self.base_url.as_str())
            .field("fetch_timeout", &self.fetch_timeout)
            .finish_non_exhaustive()
    }
}
