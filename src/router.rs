//! Request classification and dispatch to a caching strategy.

use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::cache::{CacheLayer, CacheNames, CacheStorage, GenerationKind, Served, StrategyError};
use crate::config::RoutesConfig;
use crate::event::EventScope;
use crate::http::{FetchError, Fetcher, Request, RequestKey, Response};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "avif"];
const STYLE_FONT_EXTENSIONS: &[&str] = &["css", "woff", "woff2", "ttf", "otf", "eot"];

/// Strategy picked for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Full-page navigation, handled by the navigation fallback chain
  Navigation,
  CacheFirst(GenerationKind),
  StaleWhileRevalidate(GenerationKind),
  NetworkFirst(GenerationKind),
  /// Not intercepted; goes straight to the network
  Passthrough,
}

/// Classifies requests by URL shape.
#[derive(Debug, Clone)]
pub struct Router {
  origin: Url,
  shell_paths: Vec<String>,
  assets_prefix: String,
  api_prefix: String,
  root_document: String,
}

impl Router {
  pub fn new(origin: Url, shell_paths: Vec<String>, routes: &RoutesConfig) -> Self {
    Self {
      origin,
      shell_paths,
      assets_prefix: routes.assets_prefix.clone(),
      api_prefix: routes.api_prefix.clone(),
      root_document: routes.root_document.clone(),
    }
  }

  pub fn classify(&self, request: &Request) -> Route {
    if !request.is_read() {
      return Route::Passthrough;
    }
    if request.is_navigation() {
      return Route::Navigation;
    }
    if request.url.origin() != self.origin.origin() {
      return Route::Passthrough;
    }

    let path = request.url.path();
    if self.shell_paths.iter().any(|p| p == path) {
      return Route::CacheFirst(GenerationKind::Shell);
    }
    if path.starts_with(&self.assets_prefix) {
      return Route::StaleWhileRevalidate(GenerationKind::Immutable);
    }
    if has_extension(path, IMAGE_EXTENSIONS) || has_extension(path, STYLE_FONT_EXTENSIONS) {
      return Route::StaleWhileRevalidate(GenerationKind::Dynamic);
    }
    if path.starts_with(&self.api_prefix) {
      return Route::NetworkFirst(GenerationKind::Dynamic);
    }
    Route::StaleWhileRevalidate(GenerationKind::Dynamic)
  }

  /// `/` and the root document both mean "the app shell".
  pub fn is_root(&self, url: &Url) -> bool {
    let path = url.path();
    path == "/" || path == self.root_document
  }
}

fn has_extension(path: &str, extensions: &[&str]) -> bool {
  let file = path.rsplit('/').next().unwrap_or(path);
  match file.rsplit_once('.') {
    Some((_, ext)) => extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)),
    None => false,
  }
}

/// Answers intercepted requests: classification plus strategy execution.
pub struct Dispatcher<S: CacheStorage, F: Fetcher> {
  router: Router,
  layer: CacheLayer<S, F>,
  names: CacheNames,
  root_document: RequestKey,
  offline_document: RequestKey,
}

impl<S: CacheStorage, F: Fetcher> Dispatcher<S, F> {
  pub fn new(
    router: Router,
    storage: Arc<S>,
    fetcher: Arc<F>,
    names: CacheNames,
    routes: &RoutesConfig,
  ) -> Result<Self, FetchError> {
    let root_document = RequestKey::for_path(&router.origin, &routes.root_document)?;
    let offline_document = RequestKey::for_path(&router.origin, &routes.offline_document)?;
    let layer = CacheLayer::new(storage, fetcher).with_offline_document(offline_document.clone());

    Ok(Self {
      router,
      layer,
      names,
      root_document,
      offline_document,
    })
  }

  pub async fn respond(&self, request: &Request, scope: &mut EventScope) -> Result<Served, StrategyError> {
    let route = self.router.classify(request);
    debug!(url = %request.url, method = %request.method, ?route, "dispatch");

    match route {
      Route::Navigation => self.navigate(request).await,
      Route::CacheFirst(kind) => self.layer.cache_first(&self.names.name(kind), request).await,
      Route::StaleWhileRevalidate(kind) => {
        self
          .layer
          .stale_while_revalidate(&self.names.name(kind), request, scope)
          .await
      }
      Route::NetworkFirst(kind) => self.layer.network_first(&self.names.name(kind), request).await,
      Route::Passthrough => {
        let response = self.layer.fetcher().fetch(request).await?;
        Ok(Served::from_network(response))
      }
    }
  }

  /// Navigation fallback chain.
  ///
  /// Network first. Offline, the root path gets the cached shell document;
  /// any other path gets the offline document under the requested URL (no
  /// redirect). With neither cached, a synthesized 503.
  async fn navigate(&self, request: &Request) -> Result<Served, StrategyError> {
    let err = match self.layer.fetcher().fetch(request).await {
      Ok(response) => return Ok(Served::from_network(response)),
      Err(e) => e,
    };
    debug!(url = %request.url, error = %err, "navigation offline");

    let shell = self.names.name(GenerationKind::Shell);
    let storage = self.layer.storage();

    if self.router.is_root(&request.url) {
      if let Some(doc) = storage.match_request(&shell, &self.root_document, false)? {
        return Ok(Served::fallback(doc.response));
      }
    }

    if let Some(doc) = storage.match_request(&shell, &self.offline_document, false)? {
      return Ok(Served::fallback(doc.response.with_url(request.url.clone())));
    }

    Ok(Served::fallback(Response::synthetic(
      503,
      "text/plain",
      "Offline",
      request.url.clone(),
    )))
  }
}
