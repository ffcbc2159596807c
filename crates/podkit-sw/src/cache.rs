//! Cache storage: named generations of request/response pairs.
//!
//! Mirrors the platform Cache API. [`CacheStorage`] is the `caches` global,
//! [`CacheHandle`] is what `caches.open(name)` resolves to. Every store
//! operation takes the storage lock once, so each is atomic with respect to
//! concurrently running handlers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::try_join_all;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use podkit_net::{Fetcher, Request, Response, ResponseType};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::persist;
use crate::{Result, ServiceWorkerError};

// ==================== Stored Response ====================

/// Immutable snapshot of a network response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Final response URL.
    pub url: String,

    pub status: u16,

    pub status_text: String,

    pub response_type: ResponseType,

    /// Headers in arrival order, names lowercased.
    pub headers: Vec<StoredHeader>,

    #[serde(with = "persist::base64_body")]
    pub body: Vec<u8>,
}

impl CachedResponse {
    /// Snapshot a response whose body is already loaded.
    pub fn snapshot(response: &Response) -> Result<Self> {
        let body = response.body_bytes().ok_or_else(|| {
            ServiceWorkerError::CacheError(format!(
                "response body for {} must be buffered before caching",
                response.url
            ))
        })?;

        let headers = response
            .headers
            .iter()
            .map(|(name, value)| StoredHeader::new(name.as_str(), value.as_bytes()))
            .collect();

        Ok(Self {
            url: response.url.to_string(),
            status: response.status,
            status_text: response.status_text.clone(),
            response_type: response.response_type,
            headers,
            body: body.to_vec(),
        })
    }

    /// First value of a header, if it is valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .and_then(StoredHeader::as_str)
    }

    /// Header names listed in `Vary`, lowercased.
    fn vary_names(&self) -> Vec<String> {
        self.headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case("vary"))
            .filter_map(StoredHeader::as_str)
            .flat_map(|v| v.split(','))
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Rebuild a response to hand to the requester.
    pub fn to_response(&self) -> Result<Response> {
        let url = Url::parse(&self.url)
            .map_err(|e| ServiceWorkerError::CacheError(format!("stored URL {}: {e}", self.url)))?;

        let mut headers = HeaderMap::new();
        for header in &self.headers {
            let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|e| {
                ServiceWorkerError::CacheError(format!("stored header {}: {e}", header.name))
            })?;
            let value = HeaderValue::from_bytes(&header.value).map_err(|e| {
                ServiceWorkerError::CacheError(format!("stored value of {}: {e}", header.name))
            })?;
            headers.append(name, value);
        }

        let mut response = Response::new(url, self.status, self.response_type)
            .with_body(self.body.clone());
        response.status_text = self.status_text.clone();
        response.content_type = self
            .header("content-type")
            .and_then(|s| s.parse::<mime::Mime>().ok());
        response.headers = headers;
        response.from_cache = true;
        Ok(response)
    }
}

/// One response header. Values are kept as raw bytes since they need not
/// be UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHeader {
    pub name: String,

    #[serde(with = "persist::base64_body")]
    pub value: Vec<u8>,
}

impl StoredHeader {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

// ==================== Cache Entry ====================

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL without fragment.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Request header values for every name in the response's `Vary`.
    pub vary: HashMap<String, Option<String>>,

    pub response: CachedResponse,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    fn matches(&self, request: &Request) -> bool {
        self.vary.iter().all(|(name, stored)| {
            let current = request
                .headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok());
            current == stored.as_deref()
        })
    }
}

/// Request identity key: the URL with its fragment removed.
pub fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ==================== Cache ====================

/// One cache generation.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Cache {
    /// Cache name (generation id).
    pub name: String,

    /// Creation order within its storage.
    pub(crate) sequence: u64,

    /// Entries grouped by request URL.
    entries: HashMap<String, Vec<CacheEntry>>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sequence: 0,
            entries: HashMap::new(),
        }
    }

    /// Find the entry answering `request`. Only GET requests match.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        if request.method != Method::GET {
            return None;
        }
        self.entries
            .get(&cache_key(&request.url))?
            .iter()
            .find(|entry| entry.matches(request))
    }

    /// Reject pairs the Cache API refuses to store.
    pub fn check_put(request: &Request, response: &CachedResponse) -> Result<()> {
        if request.method != Method::GET {
            return Err(ServiceWorkerError::CacheError(format!(
                "cannot cache {} request for {}",
                request.method, request.url
            )));
        }
        if response.status == 206 {
            return Err(ServiceWorkerError::CacheError(format!(
                "cannot cache partial response for {}",
                request.url
            )));
        }
        if response.vary_names().iter().any(|n| n == "*") {
            return Err(ServiceWorkerError::CacheError(format!(
                "cannot cache Vary: * response for {}",
                request.url
            )));
        }
        Ok(())
    }

    /// Store a pair, replacing whatever the request currently matches.
    pub fn put(&mut self, request: &Request, response: CachedResponse) -> Result<()> {
        Self::check_put(request, &response)?;

        let vary = response
            .vary_names()
            .into_iter()
            .map(|name| {
                let value = request
                    .headers
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                (name, value)
            })
            .collect();

        let key = cache_key(&request.url);
        let entry = CacheEntry {
            url: key.clone(),
            method: request.method.to_string(),
            vary,
            response,
            cached_at: now_millis(),
        };

        let slot = self.entries.entry(key).or_default();
        slot.retain(|existing| !existing.matches(request));
        slot.push(entry);
        Ok(())
    }

    /// Delete every entry matching the request.
    pub fn delete(&mut self, request: &Request) -> bool {
        let key = cache_key(&request.url);
        let Some(slot) = self.entries.get_mut(&key) else {
            return false;
        };
        let before = slot.len();
        slot.retain(|existing| !existing.matches(request));
        let removed = slot.len() != before;
        if slot.is_empty() {
            self.entries.remove(&key);
        }
        removed
    }

    /// Get all keys (URLs), sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_entries(self) -> Vec<CacheEntry> {
        self.entries.into_values().flatten().collect()
    }

    pub(crate) fn from_entries(name: &str, sequence: u64, entries: Vec<CacheEntry>) -> Self {
        let mut cache = Self {
            sequence,
            ..Self::new(name)
        };
        for entry in entries {
            cache.entries.entry(entry.url.clone()).or_default().push(entry);
        }
        cache
    }
}

// ==================== Cache Storage ====================

/// Cache storage (the `caches` global).
///
/// Cloning yields another handle to the same storage. When opened with
/// [`CacheStorage::open_persistent`], every mutation is written through to a
/// directory holding one JSON file per generation.
#[derive(Debug, Clone, Default)]
pub struct CacheStorage {
    /// Generations in creation order.
    caches: Arc<RwLock<Vec<Cache>>>,
    persist_dir: Option<Arc<PathBuf>>,
}

impl CacheStorage {
    /// Create new in-memory cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open storage backed by `dir`, restoring any generations found there.
    pub async fn open_persistent(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let caches = persist::load_generations(&dir).await?;
        debug!(dir = %dir.display(), generations = caches.len(), "Restored cache storage");
        Ok(Self {
            caches: Arc::new(RwLock::new(caches)),
            persist_dir: Some(Arc::new(dir)),
        })
    }

    /// Open a cache, creating it if it doesn't exist.
    pub async fn open(&self, name: &str) -> CacheHandle {
        let mut caches = self.caches.write().await;
        if !caches.iter().any(|c| c.name == name) {
            create(&mut caches, name);
        }
        CacheHandle {
            name: name.to_string(),
            storage: self.clone(),
        }
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.iter().any(|c| c.name == name)
    }

    /// Delete a cache. Returns whether it existed.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let mut caches = self.caches.write().await;
        let Some(index) = caches.iter().position(|c| c.name == name) else {
            return Ok(false);
        };
        if let Some(dir) = &self.persist_dir {
            persist::remove_generation(dir, name).await?;
        }
        caches.remove(index);
        Ok(true)
    }

    /// Get all cache names in creation order.
    pub async fn keys(&self) -> Vec<String> {
        self.caches
            .read()
            .await
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// Match across all caches, oldest generation first.
    pub async fn match_request(&self, request: &Request) -> Option<CachedResponse> {
        self.caches
            .read()
            .await
            .iter()
            .find_map(|cache| cache.match_request(request))
            .map(|entry| entry.response.clone())
    }

    async fn read<R>(&self, name: &str, f: impl FnOnce(&Cache) -> R) -> Option<R> {
        let caches = self.caches.read().await;
        caches.iter().find(|c| c.name == name).map(f)
    }

    /// Apply `f` to a copy of the generation and commit it only once it is
    /// on disk. On any error the stored generation is left untouched.
    async fn mutate<R>(&self, name: &str, f: impl FnOnce(&mut Cache) -> Result<R>) -> Result<R> {
        let mut caches = self.caches.write().await;
        let index = match caches.iter().position(|c| c.name == name) {
            Some(index) => index,
            None => create(&mut caches, name),
        };

        let mut updated = caches[index].clone();
        let result = f(&mut updated)?;

        if let Some(dir) = &self.persist_dir {
            persist::write_generation(dir, &updated).await?;
        }
        caches[index] = updated;
        Ok(result)
    }
}

/// Append a new generation after every existing one.
fn create(caches: &mut Vec<Cache>, name: &str) -> usize {
    let sequence = caches.iter().map(|c| c.sequence + 1).max().unwrap_or(0);
    trace!(cache = name, sequence, "Creating cache");
    caches.push(Cache {
        sequence,
        ..Cache::new(name)
    });
    caches.len() - 1
}

// ==================== Cache Handle ====================

/// An opened cache generation.
#[derive(Debug, Clone)]
pub struct CacheHandle {
    name: String,
    storage: CacheStorage,
}

impl CacheHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request in this generation only.
    pub async fn match_request(&self, request: &Request) -> Option<CachedResponse> {
        self.storage
            .read(&self.name, |cache| {
                cache.match_request(request).map(|e| e.response.clone())
            })
            .await
            .flatten()
    }

    /// Store a response for a request.
    pub async fn put(&self, request: &Request, response: CachedResponse) -> Result<()> {
        self.storage
            .mutate(&self.name, |cache| cache.put(request, response))
            .await
    }

    /// Fetch every request and store all responses, or store nothing.
    ///
    /// Fetches run concurrently. Any network failure or non-2xx response
    /// (opaque responses included) rejects the whole batch.
    pub async fn add_all(&self, fetcher: &dyn Fetcher, requests: Vec<Request>) -> Result<usize> {
        let fetched = try_join_all(requests.into_iter().map(|request| async move {
            let url = request.url.to_string();
            let response = fetcher
                .fetch(request.clone())
                .await
                .map_err(|e| ServiceWorkerError::Precache {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;

            if !response.ok() {
                return Err(ServiceWorkerError::Precache {
                    url,
                    reason: format!("status {} ({})", response.status, response.response_type),
                });
            }

            let response = response.buffered().await?;
            let snapshot = CachedResponse::snapshot(&response)?;
            Cache::check_put(&request, &snapshot)?;
            trace!(url = %url, "Fetched for cache");
            Ok::<_, ServiceWorkerError>((request, snapshot))
        }))
        .await?;

        let count = fetched.len();
        self.storage
            .mutate(&self.name, move |cache| {
                for (request, snapshot) in fetched {
                    cache.put(&request, snapshot)?;
                }
                Ok(count)
            })
            .await
    }

    /// Delete entries matching a request.
    pub async fn delete(&self, request: &Request) -> Result<bool> {
        self.storage
            .mutate(&self.name, |cache| Ok(cache.delete(request)))
            .await
    }

    /// Stored request URLs, sorted.
    pub async fn keys(&self) -> Vec<String> {
        self.storage
            .read(&self.name, |cache| {
                cache.keys().into_iter().map(str::to_string).collect()
            })
            .await
            .unwrap_or_default()
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.storage
            .read(&self.name, Cache::len)
            .await
            .unwrap_or_default()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{ACCEPT_LANGUAGE, CONTENT_DISPOSITION, VARY};

    fn request(url: &str) -> Request {
        Request::parse(url).unwrap()
    }

    fn stored(url: &str, body: &str) -> CachedResponse {
        CachedResponse {
            url: url.to_string(),
            status: 200,
            status_text: "OK".to_string(),
            response_type: ResponseType::Basic,
            headers: vec![StoredHeader::new("content-type", "text/plain")],
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_cache_put_and_match() {
        let mut cache = Cache::new("v1");
        let req = request("https://example.com/style.css");
        cache.put(&req, stored("https://example.com/style.css", "body{}")).unwrap();

        assert!(cache.match_request(&req).is_some());
        assert!(cache
            .match_request(&request("https://example.com/other.css"))
            .is_none());
    }

    #[test]
    fn test_fragment_ignored() {
        let mut cache = Cache::new("v1");
        cache
            .put(&request("https://example.com/pod/"), stored("https://example.com/pod/", "x"))
            .unwrap();
        assert!(cache
            .match_request(&request("https://example.com/pod/#episode-3"))
            .is_some());
    }

    #[test]
    fn test_non_get_is_rejected_and_never_matches() {
        let mut cache = Cache::new("v1");
        let url = Url::parse("https://example.com/api").unwrap();
        let post = Request::post(url.clone(), bytes::Bytes::from_static(b"{}"));

        assert!(matches!(
            cache.put(&post, stored(url.as_str(), "ok")),
            Err(ServiceWorkerError::CacheError(_))
        ));

        cache.put(&Request::get(url.clone()), stored(url.as_str(), "ok")).unwrap();
        assert!(cache.match_request(&post).is_none());
    }

    #[test]
    fn test_partial_and_vary_star_rejected() {
        let mut cache = Cache::new("v1");
        let req = request("https://example.com/ep.mp3");

        let mut partial = stored(req.url.as_str(), "..");
        partial.status = 206;
        assert!(cache.put(&req, partial).is_err());

        let mut star = stored(req.url.as_str(), "..");
        star.headers.push(StoredHeader::new("vary", "*"));
        assert!(cache.put(&req, star).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_vary_header_distinguishes_entries() {
        let mut cache = Cache::new("v1");
        let en = request("https://example.com/feed")
            .header(ACCEPT_LANGUAGE, HeaderValue::from_static("en"));
        let de = request("https://example.com/feed")
            .header(ACCEPT_LANGUAGE, HeaderValue::from_static("de"));

        let mut response = stored("https://example.com/feed", "english");
        response
            .headers
            .push(StoredHeader::new(VARY.as_str(), "Accept-Language"));
        cache.put(&en, response).unwrap();

        assert!(cache.match_request(&en).is_some());
        assert!(cache.match_request(&de).is_none());
    }

    #[test]
    fn test_put_replaces_matching_entry() {
        let mut cache = Cache::new("v1");
        let req = request("https://example.com/a");
        cache.put(&req, stored("https://example.com/a", "old")).unwrap();
        cache.put(&req, stored("https://example.com/a", "new")).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.match_request(&req).unwrap().response.body, b"new");
    }

    #[test]
    fn test_cache_delete() {
        let mut cache = Cache::new("v1");
        let req = request("https://example.com/style.css");
        cache.put(&req, stored(req.url.as_str(), "x")).unwrap();

        assert!(cache.delete(&req));
        assert!(!cache.delete(&req));
        assert!(cache.match_request(&req).is_none());
    }

    #[test]
    fn test_cached_response_round_trips_to_response() {
        let response = stored("https://example.com/a.json", "{}")
            .to_response()
            .unwrap();
        assert!(response.from_cache);
        assert_eq!(response.status, 200);
        assert_eq!(response.content_type, Some(mime::TEXT_PLAIN));
    }

    #[test]
    fn test_non_ascii_header_survives_cache() {
        let disposition = "attachment; filename=\"é.mp3\"".as_bytes();
        let original = Response::new(
            Url::parse("https://cdn.example/ep1.mp3").unwrap(),
            200,
            ResponseType::Cors,
        )
        .with_header(CONTENT_DISPOSITION, HeaderValue::from_bytes(disposition).unwrap())
        .with_body("ID3");

        let snapshot = CachedResponse::snapshot(&original).unwrap();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: CachedResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, snapshot);

        let hit = restored.to_response().unwrap();
        assert_eq!(
            hit.headers.get(CONTENT_DISPOSITION).map(HeaderValue::as_bytes),
            Some(disposition)
        );
    }

    #[tokio::test]
    async fn test_cache_storage() {
        let storage = CacheStorage::new();
        assert!(!storage.has("v1").await);

        storage.open("v1").await;
        storage.open("v2").await;
        assert_eq!(storage.keys().await, vec!["v1", "v2"]);

        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.delete("v1").await.unwrap());
        assert_eq!(storage.keys().await, vec!["v2"]);
    }

    #[tokio::test]
    async fn test_handle_put_visible_through_storage_match() {
        let storage = CacheStorage::new();
        let cache = storage.open("v1").await;
        let req = request("https://example.com/a");
        cache.put(&req, stored("https://example.com/a", "a")).await.unwrap();

        assert_eq!(cache.keys().await, vec!["https://example.com/a"]);
        assert!(storage.match_request(&req).await.is_some());
        assert!(!cache.is_empty().await);
    }
}
