//! Install and activate steps of the cache lifecycle.

use futures::future::try_join_all;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::cache::{CacheNames, CacheStorage, GenerationKind};
use crate::clients::Clients;
use crate::error::StoreError;
use crate::http::{FetchError, Fetcher, Request, RequestKey, Response};

#[derive(Debug, Error)]
pub enum LifecycleError {
  #[error("failed to fetch shell resource {url}")]
  ShellFetch {
    url: String,
    #[source]
    source: FetchError,
  },

  #[error("shell resource {url} answered {status}")]
  ShellStatus { url: String, status: u16 },

  #[error("invalid shell path {0}")]
  InvalidPath(String),

  #[error(transparent)]
  Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
  pub version: String,
  pub generation: String,
  /// Number of shell resources written
  pub cached: usize,
  /// New version should take over without waiting for old tabs to close
  pub skip_waiting: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateReport {
  /// Generations removed, oldest first
  pub deleted: Vec<String>,
  /// Tabs taken under control
  pub claimed: usize,
}

/// Owns the versioned generations for one build.
pub struct CacheLifecycle<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  clients: Clients,
  names: CacheNames,
  origin: Url,
  shell: Vec<String>,
}

impl<S: CacheStorage, F: Fetcher> CacheLifecycle<S, F> {
  pub fn new(
    storage: Arc<S>,
    fetcher: Arc<F>,
    clients: Clients,
    names: CacheNames,
    origin: Url,
    shell: Vec<String>,
  ) -> Self {
    Self {
      storage,
      fetcher,
      clients,
      names,
      origin,
      shell,
    }
  }

  /// Precache the shell.
  ///
  /// All fetches run concurrently; any failure or non-2xx answer fails the
  /// install before anything is written. The set is then stored in one
  /// transaction.
  pub async fn install(&self) -> Result<InstallReport, LifecycleError> {
    let generation = self.names.name(GenerationKind::Shell);

    let requests = self
      .shell
      .iter()
      .map(|path| {
        self
          .origin
          .join(path)
          .map(Request::get)
          .map_err(|_| LifecycleError::InvalidPath(path.clone()))
      })
      .collect::<Result<Vec<_>, _>>()?;

    let fetched = try_join_all(requests.iter().map(|req| self.fetch_shell(req))).await?;

    self.storage.put_all(&generation, &fetched)?;

    info!(
      version = self.names.version(),
      %generation,
      cached = fetched.len(),
      "shell installed"
    );

    Ok(InstallReport {
      version: self.names.version().to_string(),
      generation,
      cached: fetched.len(),
      skip_waiting: true,
    })
  }

  async fn fetch_shell(&self, request: &Request) -> Result<(RequestKey, Response), LifecycleError> {
    let response = self
      .fetcher
      .fetch(request)
      .await
      .map_err(|source| LifecycleError::ShellFetch {
        url: request.url.to_string(),
        source,
      })?;

    if !response.is_success() {
      return Err(LifecycleError::ShellStatus {
        url: request.url.to_string(),
        status: response.status,
      });
    }

    Ok((request.key(), response))
  }

  /// Drop every generation that does not belong to this build, make sure
  /// the three current ones exist, then take control of open tabs.
  pub async fn activate(&self) -> Result<ActivateReport, LifecycleError> {
    let mut deleted = Vec::new();
    for name in self.storage.generations()? {
      if !self.names.is_current(&name) && self.storage.delete_generation(&name)? {
        deleted.push(name);
      }
    }

    for name in self.names.current() {
      self.storage.open_generation(&name)?;
    }

    let claimed = self.clients.claim();
    info!(version = self.names.version(), ?deleted, claimed, "activated");

    Ok(ActivateReport { deleted, claimed })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::testing::FakeNetwork;

  const SHELL: &[&str] = &["/", "/index.html", "/offline.html", "/manifest.json"];

  fn origin() -> Url {
    Url::parse("http://app.test/").unwrap()
  }

  fn serve_shell(net: &FakeNetwork) {
    for path in SHELL {
      let url = origin().join(path).unwrap();
      net.route(url.as_str(), 200, &format!("shell {}", path));
    }
  }

  fn lifecycle(
    storage: &Arc<SqliteStorage>,
    net: &Arc<FakeNetwork>,
    clients: &Clients,
    version: &str,
  ) -> CacheLifecycle<SqliteStorage, FakeNetwork> {
    CacheLifecycle::new(
      storage.clone(),
      net.clone(),
      clients.clone(),
      CacheNames::new(version),
      origin(),
      SHELL.iter().map(|s| s.to_string()).collect(),
    )
  }

  #[tokio::test]
  async fn test_install_caches_whole_shell() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let net = Arc::new(FakeNetwork::new());
    serve_shell(&net);

    let report = lifecycle(&storage, &net, &Clients::new(), "v1").install().await.unwrap();
    assert_eq!(report.generation, "shell-v1");
    assert_eq!(report.cached, SHELL.len());
    assert!(report.skip_waiting);

    for path in SHELL {
      let key = RequestKey::for_path(&origin(), path).unwrap();
      assert!(storage.match_request("shell-v1", &key, false).unwrap().is_some());
    }
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let net = Arc::new(FakeNetwork::new());
    serve_shell(&net);
    net.route("http://app.test/manifest.json", 404, "missing");

    let err = lifecycle(&storage, &net, &Clients::new(), "v1").install().await.unwrap_err();
    assert!(matches!(err, LifecycleError::ShellStatus { status: 404, .. }));

    let key = RequestKey::for_path(&origin(), "/index.html").unwrap();
    assert!(storage.match_any(&key).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_install_fails_offline() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let net = Arc::new(FakeNetwork::new());
    net.set_online(false);

    let err = lifecycle(&storage, &net, &Clients::new(), "v1").install().await.unwrap_err();
    assert!(matches!(err, LifecycleError::ShellFetch { .. }));
  }

  #[tokio::test]
  async fn test_activate_replaces_previous_version() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let net = Arc::new(FakeNetwork::new());
    let clients = Clients::new();
    let _tab = clients.connect(origin());
    serve_shell(&net);

    let v3 = lifecycle(&storage, &net, &clients, "v3");
    v3.install().await.unwrap();
    v3.activate().await.unwrap();

    let v4 = lifecycle(&storage, &net, &clients, "v4");
    v4.install().await.unwrap();
    let report = v4.activate().await.unwrap();

    assert_eq!(report.deleted, vec!["shell-v3", "immutable-v3", "dynamic-v3"]);
    assert_eq!(report.claimed, 1);
    assert_eq!(
      storage.generations().unwrap(),
      vec!["shell-v4", "immutable-v4", "dynamic-v4"]
    );

    for path in SHELL {
      let key = RequestKey::for_path(&origin(), path).unwrap();
      let hit = storage.match_any(&key).unwrap().unwrap();
      assert_eq!(hit.generation, "shell-v4");
    }
  }
}
