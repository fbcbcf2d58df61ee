//! Caching strategies over a (cache generation, request) pair.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::Served;
use crate::error::StoreError;
use crate::event::EventScope;
use crate::http::{FetchError, Fetcher, Request, RequestKey, Response};

#[derive(Debug, Error)]
pub enum StrategyError {
  /// Neither the network nor any cache could answer
  #[error("network and cache both failed for {url}")]
  Unavailable {
    url: String,
    #[source]
    source: Option<FetchError>,
  },

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Fetch(#[from] FetchError),
}

/// Cache layer that implements the read strategies.
///
/// Sits between an intercepted request and the network. Each strategy is
/// a pure protocol over one generation; routing decides which one runs.
pub struct CacheLayer<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  /// Document served to navigations that miss both network and cache
  offline_document: Option<RequestKey>,
}

impl<S: CacheStorage, F: Fetcher> CacheLayer<S, F> {
  pub fn new(storage: Arc<S>, fetcher: Arc<F>) -> Self {
    Self {
      storage,
      fetcher,
      offline_document: None,
    }
  }

  /// Set the document network-first falls back to for navigations.
  pub fn with_offline_document(mut self, key: RequestKey) -> Self {
    self.offline_document = Some(key);
    self
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn fetcher(&self) -> &Arc<F> {
    &self.fetcher
  }

  /// Cache-first.
  ///
  /// 1. Cached match (query string ignored) is returned as is, no network
  /// 2. Otherwise fetch, store if successful, return
  ///
  /// Staleness is only resolved by replacing the generation on activation.
  pub async fn cache_first(&self, generation: &str, request: &Request) -> Result<Served, StrategyError> {
    let key = request.key();
    if let Some(cached) = self.storage.match_request(generation, &key, true)? {
      debug!(url = %request.url, generation, "cache-first hit");
      return Ok(Served::from_cache(cached));
    }

    let response = self.fetcher.fetch(request).await?;
    self.store(generation, &key, &response);
    Ok(Served::from_network(response))
  }

  /// Stale-while-revalidate.
  ///
  /// A cached match is returned immediately while a refetch runs inside
  /// `scope`. Without a match the caller waits for that same fetch.
  /// Refetch failures are swallowed once the cache has answered.
  pub async fn stale_while_revalidate(
    &self,
    generation: &str,
    request: &Request,
    scope: &mut EventScope,
  ) -> Result<Served, StrategyError> {
    let key = request.key();
    let cached = self.storage.match_request(generation, &key, true)?;

    let layer = self.clone();
    let generation_name = generation.to_string();
    let req = request.clone();
    let revalidation = async move { layer.revalidate(&generation_name, &req).await };

    match cached {
      Some(cached) => {
        debug!(url = %request.url, generation, "serving cached copy, revalidating");
        scope.wait_until(async move {
          let _ = revalidation.await;
        });
        Ok(Served::from_cache(cached))
      }
      None => match revalidation.await {
        Some(response) => Ok(Served::from_network(response)),
        None => Err(StrategyError::Unavailable {
          url: request.url.to_string(),
          source: None,
        }),
      },
    }
  }

  /// Network-first.
  ///
  /// Network success is stored and returned. On failure the cached match
  /// wins; navigations without one get the offline document.
  pub async fn network_first(&self, generation: &str, request: &Request) -> Result<Served, StrategyError> {
    let key = request.key();
    let err = match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.store(generation, &key, &response);
        return Ok(Served::from_network(response));
      }
      Err(err) => err,
    };

    debug!(url = %request.url, error = %err, "network-first falling back to cache");
    if let Some(cached) = self.storage.match_request(generation, &key, true)? {
      return Ok(Served::from_cache(cached));
    }

    if request.is_navigation() {
      if let Some(offline) = &self.offline_document {
        if let Some(doc) = self.storage.match_any(offline)? {
          return Ok(Served::fallback(doc.response.with_url(request.url.clone())));
        }
      }
    }

    Err(StrategyError::Unavailable {
      url: request.url.to_string(),
      source: Some(err),
    })
  }

  /// Fetch and store on success. `None` when the network failed.
  async fn revalidate(&self, generation: &str, request: &Request) -> Option<Response> {
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.store(generation, &request.key(), &response);
        Some(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "revalidation failed");
        None
      }
    }
  }

  /// Write-through that never fails the read path.
  fn store(&self, generation: &str, key: &RequestKey, response: &Response) {
    if !response.is_success() {
      return;
    }
    if let Err(e) = self.storage.put(generation, key, response) {
      warn!(url = %key.url, generation, error = %e, "failed to cache response");
    }
  }
}

impl<S: CacheStorage, F: Fetcher> Clone for CacheLayer<S, F> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      offline_document: self.offline_document.clone(),
    }
  }
}
