//! Network fetching.
//!
//! [`ResourceLoader`] performs real HTTP requests and classifies the result
//! the way a browser would for a page living at `LoaderConfig::origin`.

use std::time::Duration;

use async_trait::async_trait;
use http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, ORIGIN};
use http::HeaderValue;
use mime::Mime;
use reqwest::Client;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::{NetError, Request, RequestMode, Response, ResponseType};

/// Anything that can turn a [`Request`] into a [`Response`].
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform a live fetch.
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Origin of the pages the loader fetches on behalf of. `None` treats
    /// every response as same-origin.
    pub origin: Option<Url>,
    /// User agent string.
    pub user_agent: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Enable cookies.
    pub cookies_enabled: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            origin: None,
            user_agent: format!("podkit/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
            cookies_enabled: true,
        }
    }
}

impl LoaderConfig {
    /// Set the page origin.
    pub fn with_origin(mut self, origin: Url) -> Self {
        self.origin = Some(origin);
        self
    }
}

/// HTTP-backed [`Fetcher`].
pub struct ResourceLoader {
    client: Client,
    config: LoaderConfig,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(config.cookies_enabled)
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(origin = ?config.origin.as_ref().map(Url::as_str), "ResourceLoader initialized");

        Ok(Self { client, config })
    }

    fn is_same_origin(&self, url: &Url) -> bool {
        match &self.config.origin {
            Some(origin) => origin.origin() == url.origin(),
            None => true,
        }
    }

    fn page_origin(&self) -> Option<String> {
        self.config
            .origin
            .as_ref()
            .map(|o| o.origin().ascii_serialization())
    }

    fn passes_cors(&self, response: &reqwest::Response) -> bool {
        let Some(allowed) = response
            .headers()
            .get(ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        allowed == "*" || Some(allowed.to_string()) == self.page_origin()
    }
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, mode = ?request.mode, "Fetching resource");

        let same_origin = self.is_same_origin(&request.url);
        if !same_origin && request.mode == RequestMode::SameOrigin {
            warn!(url = %request.url, "Cross-origin request in same-origin mode");
            return Err(NetError::RequestFailed(format!(
                "cross-origin request to {} not allowed in same-origin mode",
                request.url
            )));
        }

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        if !same_origin && request.mode == RequestMode::Cors {
            if let Some(origin) = self.page_origin() {
                if let Ok(value) = HeaderValue::from_str(&origin) {
                    req_builder = req_builder.header(ORIGIN, value);
                }
            }
        }

        if let Some(body) = request.body {
            req_builder = req_builder.body(body);
        }

        let response = req_builder.send().await?;
        let url = response.url().clone();

        let response_type = if same_origin || request.mode == RequestMode::Navigate {
            ResponseType::Basic
        } else if request.mode == RequestMode::NoCors {
            ResponseType::Opaque
        } else if self.passes_cors(&response) {
            ResponseType::Cors
        } else {
            warn!(url = %url, "Response failed CORS check");
            return Err(NetError::Cors(url.to_string()));
        };

        if response_type == ResponseType::Opaque {
            trace!(url = %url, "Returning opaque response");
            return Ok(Response::opaque(url));
        }

        let status = response.status();
        let headers = response.headers().clone();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok());

        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            response_type = %response_type,
            body_len = body.len(),
            "Response received"
        );

        let mut result = Response::new(url, status.as_u16(), response_type).with_body(body);
        result.headers = headers;
        result.content_type = content_type;
        Ok(result)
    }
}
