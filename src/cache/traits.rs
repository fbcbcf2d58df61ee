//! Result types shared by cache storage and strategies.

use chrono::{DateTime, Utc};

use crate::http::Response;

/// A response read back from a cache generation.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// Generation the entry belongs to
  pub generation: String,
  pub cached_at: DateTime<Utc>,
}

/// Response handed back to the page, with where it came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: CacheSource::Cache,
      cached_at: Some(cached.cached_at),
    }
  }

  /// Offline stand-in (shell document, offline page or synthesized 503).
  pub fn fallback(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Fallback,
      cached_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh from the network
  Network,
  /// Matched in a cache generation
  Cache,
  /// Network unavailable, serving an offline stand-in
  Fallback,
}
