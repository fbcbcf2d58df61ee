use std::future::Future;
use tokio::task::JoinSet;
use tracing::warn;

use crate::cache::Served;
use crate::http::Request;
use crate::lifecycle::{ActivateReport, InstallReport};
use crate::messages::WorkerMessage;
use crate::push::{ClickOutcome, Notification};
use crate::sync::FlushOutcome;

/// Events delivered to the background context
#[derive(Debug)]
pub enum WorkerEvent {
  /// New build version is being installed
  Install,
  /// Installed version takes over
  Activate,
  /// Intercepted read request
  Fetch(Request),
  /// Platform background-sync opportunity for a tag
  Sync { tag: String },
  /// Message posted by a tab
  Message(WorkerMessage),
  /// Server push, raw payload if any
  Push(Option<Vec<u8>>),
  /// User clicked a shown notification (or one of its actions)
  NotificationClick {
    notification: Notification,
    action: Option<String>,
  },
}

impl WorkerEvent {
  pub fn name(&self) -> &'static str {
    match self {
      WorkerEvent::Install => "install",
      WorkerEvent::Activate => "activate",
      WorkerEvent::Fetch(_) => "fetch",
      WorkerEvent::Sync { .. } => "sync",
      WorkerEvent::Message(_) => "message",
      WorkerEvent::Push(_) => "push",
      WorkerEvent::NotificationClick { .. } => "notificationclick",
    }
  }
}

/// What handling an event produced
#[derive(Debug)]
pub enum EventOutcome {
  Installed(InstallReport),
  Activated(ActivateReport),
  Responded(Served),
  Flushed(FlushOutcome),
  Notified(Notification),
  Clicked(ClickOutcome),
}

/// Lifetime extension for a single event.
///
/// Work registered with `wait_until` may outlive the handler's return
/// value, but the event is not finished until `settle` has awaited all of
/// it. Dropping a scope without settling aborts the pending work.
pub struct EventScope {
  tasks: JoinSet<()>,
}

impl EventScope {
  pub fn new() -> Self {
    Self {
      tasks: JoinSet::new(),
    }
  }

  pub fn wait_until<F>(&mut self, work: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    self.tasks.spawn(work);
  }

  pub fn pending(&self) -> usize {
    self.tasks.len()
  }

  /// Wait for every extended task, including ones registered while waiting.
  pub async fn settle(mut self) {
    while let Some(result) = self.tasks.join_next().await {
      if let Err(e) = result {
        warn!(error = %e, "extended event work did not complete");
      }
    }
  }
}

impl Default for EventScope {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  #[tokio::test]
  async fn test_settle_waits_for_all_work() {
    let done = Arc::new(AtomicU32::new(0));
    let mut scope = EventScope::new();

    for delay in [5u64, 20, 1] {
      let done = done.clone();
      scope.wait_until(async move {
        tokio::time::sleep(Duration::from_millis(delay)).await;
        done.fetch_add(1, Ordering::SeqCst);
      });
    }

    assert_eq!(scope.pending(), 3);
    scope.settle().await;
    assert_eq!(done.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_panicking_work_does_not_break_settle() {
    let mut scope = EventScope::new();
    scope.wait_until(async { panic!("boom") });
    scope.wait_until(async {});
    scope.settle().await;
  }
}
