//! Page-side client: the write path and sync requests.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::clients::ClientConnection;
use crate::connectivity::Connectivity;
use crate::event::{EventOutcome, WorkerEvent};
use crate::messages::{ClientMessage, WorkerMessage};
use crate::store::{mirror_text, NewEntry, OutboxStore, QueuedWrite};
use crate::sync::FlushOutcome;
use crate::worker::WorkerHandle;

/// What happened to a submitted write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
  /// Accepted by the backend directly
  Sent,
  /// Stored in the outbox (and mirrored) for a later flush
  Queued(QueuedWrite),
}

/// Asks the background context to flush.
///
/// Prefers a background-sync registration for the configured tag and
/// falls back to a `SYNC_NOW` message.
#[derive(Clone)]
pub struct SyncRequester {
  worker: WorkerHandle,
  tag: String,
  background_sync: bool,
}

impl SyncRequester {
  pub fn new(worker: WorkerHandle, tag: impl Into<String>) -> Self {
    Self {
      worker,
      tag: tag.into(),
      background_sync: true,
    }
  }

  /// Platforms without background sync only get the message path.
  pub fn without_background_sync(mut self) -> Self {
    self.background_sync = false;
    self
  }

  pub async fn request(&self) -> Result<FlushOutcome> {
    let event = if self.background_sync {
      WorkerEvent::Sync {
        tag: self.tag.clone(),
      }
    } else {
      WorkerEvent::Message(WorkerMessage::SyncRequested {
        tag: Some(self.tag.clone()),
      })
    };

    match self.worker.dispatch(event).await? {
      EventOutcome::Flushed(outcome) => Ok(outcome),
      other => Err(eyre!("Unexpected reply to sync request: {:?}", other)),
    }
  }
}

/// One open page of the application.
pub struct Tab<B: Backend> {
  store: Arc<OutboxStore>,
  backend: Arc<B>,
  connectivity: Connectivity,
  connection: ClientConnection,
  sync: SyncRequester,
  mirror_sent: bool,
}

impl<B: Backend> Tab<B> {
  pub fn new(
    store: Arc<OutboxStore>,
    backend: Arc<B>,
    connectivity: Connectivity,
    connection: ClientConnection,
    sync: SyncRequester,
  ) -> Self {
    Self {
      store,
      backend,
      connectivity,
      connection,
      sync,
      mirror_sent: false,
    }
  }

  /// Also keep a (non-pending) mirror entry for writes sent directly.
  pub fn with_sent_mirror(mut self) -> Self {
    self.mirror_sent = true;
    self
  }

  /// Save a write.
  ///
  /// Online, the backend gets it directly. Offline or on any send failure
  /// it is queued with its mirror entry and a flush is requested. Only a
  /// write that can be neither sent nor queued is an error.
  pub async fn submit(&self, payload: &Value) -> Result<SubmitOutcome> {
    if self.connectivity.is_online() {
      match self.backend.post_entry(payload).await {
        Ok(()) => {
          info!("entry sent");
          if self.mirror_sent {
            if let Err(e) = self.store.add_entry(&NewEntry::sent(mirror_text(payload))) {
              warn!(error = %e, "sent entry has no mirror");
            }
          }
          return Ok(SubmitOutcome::Sent);
        }
        Err(e) => warn!(error = %e, "direct send failed, queueing"),
      }
    }

    let queued = self
      .store
      .queue_with_mirror(payload)
      .map_err(|e| eyre!("Entry could not be sent or saved: {}", e))?;
    info!(outbox_id = queued.outbox_id, "entry queued");

    match self.sync.request().await {
      Ok(outcome) => debug!(?outcome, "sync requested after queueing"),
      Err(e) => warn!(error = %e, "could not request sync"),
    }

    Ok(SubmitOutcome::Queued(queued))
  }

  pub async fn request_sync(&self) -> Result<FlushOutcome> {
    self.sync.request().await
  }

  /// Request a flush on every offline → online transition.
  ///
  /// The watcher stops once every `Connectivity` handle is gone.
  pub fn watch_connectivity(&self) -> JoinHandle<()> {
    let mut rx = self.connectivity.subscribe();
    let sync = self.sync.clone();

    tokio::spawn(async move {
      let mut online = *rx.borrow_and_update();
      while rx.changed().await.is_ok() {
        let now = *rx.borrow_and_update();
        if now && !online {
          info!("connection regained, requesting sync");
          match sync.request().await {
            Ok(outcome) => debug!(?outcome, "sync after reconnect"),
            Err(e) => warn!(error = %e, "could not request sync"),
          }
        }
        online = now;
      }
    })
  }

  /// Next message from the background context.
  pub async fn next_message(&mut self) -> Option<ClientMessage> {
    let message = self.connection.recv().await?;
    self.apply(&message);
    Some(message)
  }

  pub fn try_next_message(&mut self) -> Option<ClientMessage> {
    let message = self.connection.try_recv()?;
    self.apply(&message);
    Some(message)
  }

  /// Drop mirror rows for delivered items. Usually already gone, since
  /// the flush commit removes them; a repeat delete is harmless.
  fn apply(&self, message: &ClientMessage) {
    match message {
      ClientMessage::OutboxFlushed { ids } => {
        info!(count = ids.len(), "entries synced");
        if let Err(e) = self.store.delete_mirrored_by_outbox_ids(ids) {
          warn!(error = %e, "could not drop synced mirror entries");
        }
      }
    }
  }
}
