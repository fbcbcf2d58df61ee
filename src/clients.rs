//! Registry of open tabs controlled by the background context.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use url::Url;

use crate::messages::ClientMessage;

pub type ClientId = u64;

/// Snapshot of one open tab
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
  pub id: ClientId,
  pub url: Url,
  pub focused: bool,
  /// Whether the active background context controls this tab
  pub controlled: bool,
}

struct Slot {
  info: ClientInfo,
  mailbox: mpsc::UnboundedSender<ClientMessage>,
}

#[derive(Default)]
struct Registry {
  next_id: ClientId,
  slots: BTreeMap<ClientId, Slot>,
}

/// Shared handle to the open-tab registry.
#[derive(Clone, Default)]
pub struct Clients {
  inner: Arc<Mutex<Registry>>,
}

/// A tab's end of the message channel.
pub struct ClientConnection {
  pub id: ClientId,
  rx: mpsc::UnboundedReceiver<ClientMessage>,
}

impl ClientConnection {
  pub async fn recv(&mut self) -> Option<ClientMessage> {
    self.rx.recv().await
  }

  pub fn try_recv(&mut self) -> Option<ClientMessage> {
    self.rx.try_recv().ok()
  }
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  fn registry(&self) -> MutexGuard<'_, Registry> {
    // Registry updates are single assignments; a panic cannot leave it torn
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Register a tab showing `url`. New tabs are uncontrolled until claimed.
  pub fn connect(&self, url: Url) -> ClientConnection {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut registry = self.registry();
    registry.next_id += 1;
    let id = registry.next_id;
    registry.slots.insert(
      id,
      Slot {
        info: ClientInfo {
          id,
          url,
          focused: false,
          controlled: false,
        },
        mailbox: tx,
      },
    );
    ClientConnection { id, rx }
  }

  /// Every open tab, controlled or not.
  pub fn match_all(&self) -> Vec<ClientInfo> {
    self.registry().slots.values().map(|s| s.info.clone()).collect()
  }

  /// Post to every open tab. Returns how many mailboxes accepted it.
  ///
  /// Tabs whose connection was dropped are forgotten here.
  pub fn post_all(&self, message: &ClientMessage) -> usize {
    let mut registry = self.registry();
    registry
      .slots
      .retain(|_, slot| slot.mailbox.send(message.clone()).is_ok());
    registry.slots.len()
  }

  /// Focus a tab (and unfocus the others).
  pub fn focus(&self, id: ClientId) -> bool {
    let mut registry = self.registry();
    if !registry.slots.contains_key(&id) {
      return false;
    }
    for slot in registry.slots.values_mut() {
      slot.info.focused = slot.info.id == id;
    }
    true
  }

  pub fn navigate(&self, id: ClientId, url: Url) -> bool {
    match self.registry().slots.get_mut(&id) {
      Some(slot) => {
        slot.info.url = url;
        true
      }
      None => false,
    }
  }

  /// Open a new focused tab at `url`.
  pub fn open_window(&self, url: Url) -> ClientConnection {
    let connection = self.connect(url);
    self.focus(connection.id);
    connection
  }

  /// Take control of every open tab without a reload.
  pub fn claim(&self) -> usize {
    let mut registry = self.registry();
    for slot in registry.slots.values_mut() {
      slot.info.controlled = true;
    }
    registry.slots.len()
  }
}
