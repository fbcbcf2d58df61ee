use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const BACKEND_URL_ENV: &str = "OUTPOST_BACKEND_URL";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Application origin whose requests are intercepted
  pub origin: Url,
  /// Base URL of the write and push endpoints
  pub backend_url: Url,
  /// Suffix of every cache generation name
  pub build_version: String,
  /// Where cache.db and outbox.db live (defaults to the platform data dir)
  pub data_dir: Option<PathBuf>,
  /// Paths precached on install and served cache-first
  pub shell: Vec<String>,
  pub routes: RoutesConfig,
  /// Background-sync tag the outbox flush answers to
  pub sync_tag: String,
  /// Whether tabs can register background sync; otherwise they post
  /// `SYNC_NOW` messages
  pub background_sync: bool,
  pub push: PushConfig,
  pub request_timeout_secs: u64,
  /// How long a flush lease stays valid if its holder dies mid-flush
  pub flush_lease_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  pub assets_prefix: String,
  pub api_prefix: String,
  pub offline_document: String,
  pub root_document: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushConfig {
  pub icon: String,
  pub title: String,
  pub body: String,
  pub tag: String,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: local_url("http://localhost:5173/"),
      backend_url: local_url("http://localhost:3000/"),
      build_version: "v3.3".to_string(),
      data_dir: None,
      shell: [
        "/",
        "/index.html",
        "/offline.html",
        "/manifest.json",
        "/vite.svg",
        "/icons/icon-192.png",
        "/icons/icon-512.png",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      routes: RoutesConfig::default(),
      sync_tag: "sync-entries".to_string(),
      background_sync: true,
      push: PushConfig::default(),
      request_timeout_secs: 15,
      flush_lease_secs: 60,
    }
  }
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      assets_prefix: "/assets/".to_string(),
      api_prefix: "/api/".to_string(),
      offline_document: "/offline.html".to_string(),
      root_document: "/index.html".to_string(),
    }
  }
}

impl Default for PushConfig {
  fn default() -> Self {
    Self {
      icon: "/icons/icon-192.png".to_string(),
      title: "Notificación".to_string(),
      body: "Tienes un nuevo mensaje.".to_string(),
      tag: "demo-push".to_string(),
    }
  }
}

fn local_url(s: &str) -> Url {
  // Compile-time constants; parse cannot fail
  Url::parse(s).unwrap_or_else(|_| unreachable!("invalid built-in url {}", s))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./outpost.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/outpost/config.yaml
  ///
  /// Without any file the built-in defaults apply. `OUTPOST_BACKEND_URL`
  /// overrides `backend_url` either way.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    config.with_env_overrides()
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("outpost.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("outpost").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn with_env_overrides(self) -> Result<Self> {
    match std::env::var(BACKEND_URL_ENV) {
      Ok(raw) => self.with_backend_url(&raw),
      Err(_) => Ok(self),
    }
  }

  pub fn with_backend_url(mut self, raw: &str) -> Result<Self> {
    self.backend_url = Url::parse(raw).map_err(|e| eyre!("Invalid backend url {}: {}", raw, e))?;
    Ok(self)
  }

  /// Resolved data directory.
  pub fn data_dir(&self) -> Result<PathBuf> {
    match &self.data_dir {
      Some(dir) => Ok(dir.clone()),
      None => dirs::data_dir()
        .map(|d| d.join("outpost"))
        .ok_or_else(|| eyre!("Could not determine data directory; pass --data-dir")),
    }
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_defaults_cover_the_shell() {
    let config = Config::default();
    assert_eq!(config.build_version, "v3.3");
    assert_eq!(config.sync_tag, "sync-entries");
    assert!(config.shell.contains(&"/offline.html".to_string()));
    assert!(config.shell.contains(&"/index.html".to_string()));
    assert_eq!(config.routes.api_prefix, "/api/");
  }

  #[test]
  fn test_partial_file_keeps_defaults() {
    let config = Config::parse(
      "origin: https://notes.example/\nbuild_version: v4\nroutes:\n  api_prefix: /backend/\n",
    )
    .unwrap();
    assert_eq!(config.origin.as_str(), "https://notes.example/");
    assert_eq!(config.build_version, "v4");
    assert_eq!(config.routes.api_prefix, "/backend/");
    assert_eq!(config.routes.assets_prefix, "/assets/");
    assert_eq!(config.push.tag, "demo-push");
  }

  #[test]
  fn test_bad_origin_is_rejected() {
    assert!(Config::parse("origin: not a url\n").is_err());
  }

  #[test]
  fn test_explicit_missing_path_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::load(Some(&dir.path().join("nope.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_load_from_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outpost.yaml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
      file,
      "sync_tag: sync-notes\nbackground_sync: false\nrequest_timeout_secs: 3"
    )
    .unwrap();

    let config = Config::load_from_path(&path).unwrap();
    assert_eq!(config.sync_tag, "sync-notes");
    assert!(!config.background_sync);
    assert_eq!(config.request_timeout(), Duration::from_secs(3));
  }

  #[test]
  fn test_backend_url_override() {
    let config = Config::default().with_backend_url("https://api.notes.example").unwrap();
    assert_eq!(config.backend_url.as_str(), "https://api.notes.example/");
    assert!(Config::default().with_backend_url("::").is_err());
  }
}
