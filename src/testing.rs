//! Scripted in-process network used by unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::backend::Backend;
use crate::http::{FetchError, Fetcher, Request, Response};
use crate::store::OutboxItem;

#[derive(Default)]
struct State {
  offline: bool,
  routes: HashMap<String, (u16, Vec<u8>)>,
  fetches: Vec<String>,
  batch_status: Option<u16>,
  batches: Vec<(Vec<i64>, bool)>,
  entries: Vec<Value>,
  subscriptions: Vec<Value>,
  hold: Option<Arc<Notify>>,
  hold_fetch: Option<Arc<Notify>>,
}

/// Fake origin server + backend. Unknown URLs answer 404.
#[derive(Default)]
pub struct FakeNetwork {
  state: Mutex<State>,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_online(&self, online: bool) {
    self.state.lock().unwrap().offline = !online;
  }

  pub fn route(&self, url: &str, status: u16, body: &str) {
    self
      .state
      .lock()
      .unwrap()
      .routes
      .insert(url.to_string(), (status, body.as_bytes().to_vec()));
  }

  pub fn fetch_count(&self, url: &str) -> usize {
    self.state.lock().unwrap().fetches.iter().filter(|u| *u == url).count()
  }

  pub fn set_batch_status(&self, status: u16) {
    self.state.lock().unwrap().batch_status = Some(status);
  }

  /// Every batch that reached the backend, accepted or not.
  pub fn batches(&self) -> Vec<Vec<i64>> {
    self.state.lock().unwrap().batches.iter().map(|(ids, _)| ids.clone()).collect()
  }

  pub fn accepted_batches(&self) -> Vec<Vec<i64>> {
    self
      .state
      .lock()
      .unwrap()
      .batches
      .iter()
      .filter(|(_, ok)| *ok)
      .map(|(ids, _)| ids.clone())
      .collect()
  }

  pub fn entries(&self) -> Vec<Value> {
    self.state.lock().unwrap().entries.clone()
  }

  pub fn subscriptions(&self) -> Vec<Value> {
    self.state.lock().unwrap().subscriptions.clone()
  }

  /// Make batch submissions wait until the returned notify fires.
  pub fn hold_batches(&self) -> Arc<Notify> {
    let notify = Arc::new(Notify::new());
    self.state.lock().unwrap().hold = Some(notify.clone());
    notify
  }

  /// Make the next fetch wait until the returned notify fires.
  pub fn hold_fetches(&self) -> Arc<Notify> {
    let notify = Arc::new(Notify::new());
    self.state.lock().unwrap().hold_fetch = Some(notify.clone());
    notify
  }

  fn check_online(&self, what: &str) -> Result<(), FetchError> {
    if self.state.lock().unwrap().offline {
      return Err(FetchError::Network(format!("offline: {}", what)));
    }
    Ok(())
  }

  fn status_result(status: u16, url: &str) -> Result<(), FetchError> {
    if (200..300).contains(&status) {
      Ok(())
    } else {
      Err(FetchError::Status {
        status,
        url: url.to_string(),
      })
    }
  }
}

#[async_trait]
impl Fetcher for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    self.check_online(request.url.as_str())?;
    let hold = self.state.lock().unwrap().hold_fetch.take();
    if let Some(hold) = hold {
      hold.notified().await;
    }

    let mut state = self.state.lock().unwrap();
    state.fetches.push(request.url.to_string());

    let (status, body) = state
      .routes
      .get(request.url.as_str())
      .cloned()
      .unwrap_or((404, b"not found".to_vec()));

    Ok(Response::new(status, body, request.url.clone()))
  }
}

#[async_trait]
impl Backend for FakeNetwork {
  async fn post_batch(&self, items: &[OutboxItem]) -> Result<(), FetchError> {
    self.check_online("/api/entries/batch")?;
    let hold = self.state.lock().unwrap().hold.take();
    if let Some(hold) = hold {
      hold.notified().await;
    }

    let mut state = self.state.lock().unwrap();
    let status = state.batch_status.unwrap_or(201);
    let ok = (200..300).contains(&status);
    state
      .batches
      .push((items.iter().map(|i| i.id).collect(), ok));
    Self::status_result(status, "/api/entries/batch")
  }

  async fn post_entry(&self, payload: &Value) -> Result<(), FetchError> {
    self.check_online("/api/entries")?;
    self.state.lock().unwrap().entries.push(payload.clone());
    Ok(())
  }

  async fn subscribe_push(&self, subscription: &Value) -> Result<(), FetchError> {
    self.check_online("/api/push/subscribe")?;
    if subscription.get("endpoint").is_none() {
      return Self::status_result(400, "/api/push/subscribe");
    }
    self.state.lock().unwrap().subscriptions.push(subscription.clone());
    Ok(())
  }

  async fn push_test(&self) -> Result<(), FetchError> {
    self.check_online("/api/push/test")
  }
}
