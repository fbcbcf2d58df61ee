//! Client for the backend write and push endpoints.
//!
//! The backend is opaque: every call either succeeds (2xx) or fails.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::http::{FetchError, Gated};
use crate::store::OutboxItem;

#[async_trait]
pub trait Backend: Send + Sync + 'static {
  /// Submit a whole outbox snapshot as one batch.
  async fn post_batch(&self, items: &[OutboxItem]) -> Result<(), FetchError>;

  /// Online fast path for a single write.
  async fn post_entry(&self, payload: &Value) -> Result<(), FetchError>;

  /// Register a push subscription.
  async fn subscribe_push(&self, subscription: &Value) -> Result<(), FetchError>;

  /// Ask the backend to push a test notification to every subscription.
  async fn push_test(&self) -> Result<(), FetchError>;
}

#[derive(Serialize)]
struct BatchBody<'a> {
  items: &'a [OutboxItem],
}

/// `Backend` over HTTP with JSON bodies.
#[derive(Clone)]
pub struct HttpBackend {
  client: reqwest::Client,
  base: Url,
}

impl HttpBackend {
  /// Endpoints resolve below `base`, keeping any path prefix it has.
  pub fn new(mut base: Url, timeout: Duration) -> Result<Self, FetchError> {
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| FetchError::Network(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self { client, base })
  }

  fn endpoint(&self, path: &str) -> Result<Url, FetchError> {
    self
      .base
      .join(path)
      .map_err(|e| FetchError::InvalidUrl(format!("{}{}: {}", self.base, path, e)))
  }

  async fn post_json<T: Serialize + ?Sized + Sync>(&self, path: &str, body: &T) -> Result<(), FetchError> {
    let url = self.endpoint(path)?;

    let resp = self
      .client
      .post(url.clone())
      .json(body)
      .send()
      .await
      .map_err(|e| FetchError::Network(format!("POST {}: {}", url, e)))?;

    let status = resp.status();
    if !status.is_success() {
      return Err(FetchError::Status {
        status: status.as_u16(),
        url: url.to_string(),
      });
    }

    Ok(())
  }
}

#[async_trait]
impl Backend for HttpBackend {
  async fn post_batch(&self, items: &[OutboxItem]) -> Result<(), FetchError> {
    self
      .post_json("api/entries/batch", &BatchBody { items })
      .await
  }

  async fn post_entry(&self, payload: &Value) -> Result<(), FetchError> {
    self.post_json("api/entries", payload).await
  }

  async fn subscribe_push(&self, subscription: &Value) -> Result<(), FetchError> {
    self.post_json("api/push/subscribe", subscription).await
  }

  async fn push_test(&self) -> Result<(), FetchError> {
    self.post_json("api/push/test", &serde_json::json!({})).await
  }
}

#[async_trait]
impl<B: Backend> Backend for Gated<B> {
  async fn post_batch(&self, items: &[OutboxItem]) -> Result<(), FetchError> {
    self.check("/api/entries/batch")?;
    self.inner().post_batch(items).await
  }

  async fn post_entry(&self, payload: &Value) -> Result<(), FetchError> {
    self.check("/api/entries")?;
    self.inner().post_entry(payload).await
  }

  async fn subscribe_push(&self, subscription: &Value) -> Result<(), FetchError> {
    self.check("/api/push/subscribe")?;
    self.inner().subscribe_push(subscription).await
  }

  async fn push_test(&self) -> Result<(), FetchError> {
    self.check("/api/push/test")?;
    self.inner().push_test().await
  }
}
