//! Outbox flush protocol.
//!
//! One attempt walks `Idle → Reading → Sending → (Committing | Aborted)`:
//! snapshot the outbox, submit the whole snapshot as one batch, and only
//! on acceptance delete the submitted items, their mirror entries, and
//! tell every open tab. At most one attempt runs at a time, enforced both
//! in-process and through a lease persisted in the store.

use chrono::Duration;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::clients::Clients;
use crate::error::StoreError;
use crate::messages::ClientMessage;
use crate::store::OutboxStore;

/// Phase of the current flush attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
  Idle,
  Reading,
  Sending,
  Committing,
  Aborted,
}

/// What asked for a flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTrigger {
  /// `SYNC_NOW` posted by a tab
  UserRequested,
  /// Platform background-sync opportunity for a registered tag
  BackgroundSync { tag: String },
}

/// Result of one flush attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
  /// Outbox was empty, nothing sent
  Empty,
  /// Backend accepted the batch; these items were cleared
  Delivered { ids: Vec<i64> },
  /// Send failed or was rejected; outbox untouched
  Aborted { reason: String },
  /// Another attempt holds the flush lock
  InFlight,
  /// Background sync for a tag this orchestrator does not own
  Ignored,
}

/// Drains the outbox to the backend.
pub struct SyncOrchestrator<B: Backend> {
  store: Arc<OutboxStore>,
  backend: Arc<B>,
  clients: Clients,
  sync_tag: String,
  lease_ttl: Duration,
  running: Mutex<()>,
  attempts: AtomicU64,
  state: watch::Sender<FlushState>,
}

/// Holds the persisted flush lease; releases it when dropped.
struct FlushGuard<'a> {
  store: &'a OutboxStore,
  holder: String,
}

impl<'a> FlushGuard<'a> {
  fn acquire(store: &'a OutboxStore, holder: String, ttl: Duration) -> Result<Option<Self>, StoreError> {
    if store.try_acquire_lease(&holder, ttl)? {
      Ok(Some(Self { store, holder }))
    } else {
      Ok(None)
    }
  }
}

impl Drop for FlushGuard<'_> {
  fn drop(&mut self) {
    if let Err(e) = self.store.release_lease(&self.holder) {
      warn!(holder = %self.holder, error = %e, "failed to release flush lease");
    }
  }
}

impl<B: Backend> SyncOrchestrator<B> {
  pub fn new(store: Arc<OutboxStore>, backend: Arc<B>, clients: Clients, sync_tag: impl Into<String>) -> Self {
    let (state, _rx) = watch::channel(FlushState::Idle);
    Self {
      store,
      backend,
      clients,
      sync_tag: sync_tag.into(),
      lease_ttl: Duration::seconds(60),
      running: Mutex::new(()),
      attempts: AtomicU64::new(0),
      state,
    }
  }

  /// How long a lease stays valid if its holder never releases it.
  pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
    self.lease_ttl = ttl;
    self
  }

  pub fn subscribe_state(&self) -> watch::Receiver<FlushState> {
    self.state.subscribe()
  }

  pub fn state(&self) -> FlushState {
    *self.state.borrow()
  }

  fn enter(&self, state: FlushState) {
    debug!(?state, "flush state");
    self.state.send_replace(state);
  }

  /// Run one flush attempt.
  ///
  /// Storage failures are returned; network and backend failures are an
  /// `Aborted` outcome that leaves the outbox for a later trigger.
  pub async fn flush(&self, trigger: SyncTrigger) -> Result<FlushOutcome, StoreError> {
    if let SyncTrigger::BackgroundSync { tag } = &trigger {
      if *tag != self.sync_tag {
        debug!(%tag, "ignoring background sync for unknown tag");
        return Ok(FlushOutcome::Ignored);
      }
    }

    let Ok(_running) = self.running.try_lock() else {
      debug!(?trigger, "flush already running in this context");
      return Ok(FlushOutcome::InFlight);
    };

    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
    let holder = format!("{}:{}", std::process::id(), attempt);
    let Some(_lease) = FlushGuard::acquire(&self.store, holder, self.lease_ttl)? else {
      debug!(?trigger, "flush lease held by another context");
      return Ok(FlushOutcome::InFlight);
    };

    info!(?trigger, "flush started");
    let outcome = self.attempt().await;
    self.enter(FlushState::Idle);
    outcome
  }

  async fn attempt(&self) -> Result<FlushOutcome, StoreError> {
    self.enter(FlushState::Reading);
    let items = self.store.read_all()?;
    if items.is_empty() {
      info!("outbox empty, nothing to send");
      return Ok(FlushOutcome::Empty);
    }

    let ids: Vec<i64> = items.iter().map(|item| item.id).collect();

    self.enter(FlushState::Sending);
    if let Err(e) = self.backend.post_batch(&items).await {
      self.enter(FlushState::Aborted);
      warn!(count = ids.len(), error = %e, "flush aborted, items stay in outbox");
      return Ok(FlushOutcome::Aborted {
        reason: e.to_string(),
      });
    }

    // Only the submitted ids: items queued while sending stay for next time
    self.enter(FlushState::Committing);
    let cleared = self.store.clear(Some(&ids))?;
    let mirrored = self.store.delete_mirrored_by_outbox_ids(&ids)?;
    let notified = self
      .clients
      .post_all(&ClientMessage::OutboxFlushed { ids: ids.clone() });

    info!(cleared, mirrored, notified, "outbox flushed");
    Ok(FlushOutcome::Delivered { ids })
  }
}
