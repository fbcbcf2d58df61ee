use std::sync::Arc;
use tokio::sync::watch;

/// Process-wide online/offline indicator.
///
/// Tabs read it to pick between the direct-send path and queuing, and
/// subscribe to it to request a flush when the connection comes back.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Update the signal. Subscribers are only woken on an actual change.
  pub fn set_online(&self, online: bool) {
    self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_subscribers_see_transitions() {
    let connectivity = Connectivity::new(false);
    let mut rx = connectivity.subscribe();

    connectivity.set_online(true);
    rx.changed().await.unwrap();
    assert!(*rx.borrow_and_update());
    assert!(connectivity.is_online());
  }

  #[test]
  fn test_same_value_does_not_notify() {
    let connectivity = Connectivity::new(true);
    let rx = connectivity.subscribe();
    connectivity.set_online(true);
    assert!(!rx.has_changed().unwrap());
  }
}
