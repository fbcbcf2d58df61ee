//! Request/response model shared by the cache strategies and the network.
//!
//! Requests are keyed by method + URL (fragment dropped). Matching may
//! optionally ignore the query string, so each key carries both forms.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::connectivity::Connectivity;

/// How the request was issued by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  /// Full-page document navigation
  Navigate,
  /// Subresource request to the page's own origin
  SameOrigin,
  /// Subresource request to another origin
  Cors,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub mode: RequestMode,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      mode: RequestMode::SameOrigin,
    }
  }

  pub fn navigate(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      mode: RequestMode::Navigate,
    }
  }

  pub fn with_method(mut self, method: &str) -> Self {
    self.method = method.to_ascii_uppercase();
    self
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  /// GET-equivalent requests are the only ones the cache ever answers.
  pub fn is_read(&self) -> bool {
    matches!(self.method.as_str(), "GET" | "HEAD")
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  pub fn key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }
}

/// Normalized request identity used as the cache lookup key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
  pub method: String,
  /// URL without fragment
  pub url: String,
  /// URL without fragment and query string
  pub url_no_search: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &Url) -> Self {
    let mut exact = url.clone();
    exact.set_fragment(None);
    let mut bare = exact.clone();
    bare.set_query(None);

    Self {
      method: method.to_ascii_uppercase(),
      url: exact.to_string(),
      url_no_search: bare.to_string(),
    }
  }

  /// GET key for a path on the given origin.
  pub fn for_path(origin: &Url, path: &str) -> Result<Self, FetchError> {
    let url = origin
      .join(path)
      .map_err(|e| FetchError::InvalidUrl(format!("{}: {}", path, e)))?;
    Ok(Self::new("GET", &url))
  }

  /// Stable hash of the exact identity.
  pub fn hash(&self) -> String {
    digest(&self.method, &self.url)
  }

  /// Stable hash of the identity with the query string ignored.
  pub fn search_hash(&self) -> String {
    digest(&self.method, &self.url_no_search)
  }
}

fn digest(method: &str, url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(method.as_bytes());
  hasher.update(b" ");
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}

/// A captured response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  /// URL the response is presented under
  pub url: Url,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>, url: Url) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
      url,
    }
  }

  /// A locally generated response that never touched the network.
  pub fn synthetic(status: u16, content_type: &str, body: impl Into<Vec<u8>>, url: Url) -> Self {
    Self::new(status, body, url).with_header("content-type", content_type)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_url(mut self, url: Url) -> Self {
    self.url = url;
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Network-level failure. A non-2xx response is not an error for
/// `Fetcher`; the backend client reports it as `Status`.
#[derive(Debug, Error)]
pub enum FetchError {
  #[error("network error: {0}")]
  Network(String),

  #[error("unexpected status {status} from {url}")]
  Status { status: u16, url: String },

  #[error("invalid url: {0}")]
  InvalidUrl(String),

  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

/// Something that can perform a network round trip for a request.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// `Fetcher` backed by a reqwest client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self, FetchError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| FetchError::Network(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| FetchError::InvalidRequest(format!("{}: {}", request.method, e)))?;

    let resp = self
      .client
      .request(method, request.url.clone())
      .send()
      .await
      .map_err(|e| FetchError::Network(format!("{}: {}", request.url, e)))?;

    let status = resp.status().as_u16();
    let url = resp.url().clone();
    let headers = resp
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = resp
      .bytes()
      .await
      .map_err(|e| FetchError::Network(format!("Failed to read body of {}: {}", url, e)))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
      url,
    })
  }
}

/// Wraps a network client so every call fails while the connectivity
/// signal reports offline.
pub struct Gated<T> {
  inner: T,
  connectivity: Connectivity,
}

impl<T> Gated<T> {
  pub fn new(inner: T, connectivity: Connectivity) -> Self {
    Self {
      inner,
      connectivity,
    }
  }

  pub fn inner(&self) -> &T {
    &self.inner
  }

  /// `Err(Network)` while offline.
  pub fn check(&self, target: &str) -> Result<(), FetchError> {
    if self.connectivity.is_online() {
      Ok(())
    } else {
      Err(FetchError::Network(format!("offline: {}", target)))
    }
  }
}

#[async_trait]
impl<F: Fetcher> Fetcher for Gated<F> {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    self.check(request.url.as_str())?;
    self.inner.fetch(request).await
  }
}
