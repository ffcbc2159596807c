//! # podkit Net
//!
//! Request/response model and network fetching for the podkit offline worker.
//!
//! ## Design Goals
//!
//! 1. **fetch() semantics**: responses carry a type (`basic`, `cors`,
//!    `opaque`, `error`) the way a browser classifies them
//! 2. **Single-read bodies**: streamed bodies are consumed once and must be
//!    buffered before they can be duplicated
//! 3. **Pluggable transport**: everything above this crate talks to the
//!    network through the [`Fetcher`] trait

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use mime::Mime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

pub mod fetcher;

pub use fetcher::{Fetcher, LoaderConfig, ResourceLoader};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("CORS check failed for {0}")]
    Cors(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, deciding how cross-origin responses are exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Cross-origin requests fail.
    SameOrigin,
    /// Cross-origin responses must pass a CORS check.
    #[default]
    Cors,
    /// Cross-origin responses become opaque.
    NoCors,
    /// Top-level document navigation.
    Navigate,
}

/// HTTP request.
///
/// The body is fully buffered, so cloning a request is the way to hand one
/// copy to the network while keeping the original for cache bookkeeping.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Parse a URL and create a GET request for it.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Whether this is a top-level navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// Response type as exposed to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Same-origin response.
    Basic,
    /// Cross-origin response that passed the CORS check.
    Cors,
    /// Cross-origin no-cors response; status, headers and body are hidden.
    Opaque,
    /// Network error.
    Error,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Basic => "basic",
            ResponseType::Cors => "cors",
            ResponseType::Opaque => "opaque",
            ResponseType::Error => "error",
        }
    }
}

impl std::fmt::Display for ResponseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP response.
///
/// `status` is a raw code because opaque and error responses report `0`,
/// which is not a valid [`http::StatusCode`].
#[derive(Debug)]
pub struct Response {
    pub url: Url,
    pub status: u16,
    pub status_text: String,
    pub response_type: ResponseType,
    pub headers: HeaderMap,
    pub content_type: Option<Mime>,
    pub from_cache: bool,
    body: ResponseBody,
}

/// Response body variants.
#[derive(Debug)]
enum ResponseBody {
    /// Full body already loaded.
    Full(Bytes),
    /// Streaming body; readable once.
    Stream(mpsc::Receiver<Result<Bytes, NetError>>),
    /// Empty.
    Empty,
}

impl Response {
    /// Create a response with an empty body.
    pub fn new(url: Url, status: u16, response_type: ResponseType) -> Self {
        Self {
            url,
            status,
            status_text: canonical_reason(status).to_string(),
            response_type,
            headers: HeaderMap::new(),
            content_type: None,
            from_cache: false,
            body: ResponseBody::Empty,
        }
    }

    /// Create an opaque response.
    pub fn opaque(url: Url) -> Self {
        Self::new(url, 0, ResponseType::Opaque)
    }

    /// Attach a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        if name == http::header::CONTENT_TYPE {
            self.content_type = value.to_str().ok().and_then(|s| s.parse::<Mime>().ok());
        }
        self.headers.insert(name, value);
        self
    }

    /// Attach a fully loaded body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = ResponseBody::Full(body.into());
        self
    }

    /// Attach a streaming body.
    pub fn with_stream(mut self, stream: mpsc::Receiver<Result<Bytes, NetError>>) -> Self {
        self.body = ResponseBody::Stream(stream);
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the body is still an unread stream.
    pub fn is_streaming(&self) -> bool {
        matches!(self.body, ResponseBody::Stream(_))
    }

    /// Duplicate the response. Returns `None` for streaming bodies, which
    /// must be [`buffered`](Self::buffered) first.
    pub fn try_clone(&self) -> Option<Self> {
        let body = match &self.body {
            ResponseBody::Full(b) => ResponseBody::Full(b.clone()),
            ResponseBody::Empty => ResponseBody::Empty,
            ResponseBody::Stream(_) => return None,
        };
        Some(Self {
            url: self.url.clone(),
            status: self.status,
            status_text: self.status_text.clone(),
            response_type: self.response_type,
            headers: self.headers.clone(),
            content_type: self.content_type.clone(),
            from_cache: self.from_cache,
            body,
        })
    }

    /// Drain a streaming body into memory so the response can be cloned.
    pub async fn buffered(mut self) -> Result<Self, NetError> {
        if let ResponseBody::Stream(rx) = &mut self.body {
            let mut chunks = Vec::new();
            while let Some(chunk) = rx.recv().await {
                chunks.push(chunk?);
            }
            let body: Bytes = chunks.into_iter().flatten().collect();
            self.body = ResponseBody::Full(body);
        }
        Ok(self)
    }

    /// Get the body as bytes.
    pub async fn bytes(self) -> Result<Bytes, NetError> {
        match self.buffered().await?.body {
            ResponseBody::Full(b) => Ok(b),
            _ => Ok(Bytes::new()),
        }
    }

    /// Get the body as text.
    pub async fn text(self) -> Result<String, NetError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Borrow a loaded body. `None` while the body is still streaming.
    pub fn body_bytes(&self) -> Option<Bytes> {
        match &self.body {
            ResponseBody::Full(b) => Some(b.clone()),
            ResponseBody::Empty => Some(Bytes::new()),
            ResponseBody::Stream(_) => None,
        }
    }
}

fn canonical_reason(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
}
