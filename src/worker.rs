//! The background context.
//!
//! Every event is handled in its own task with its own `EventScope`; all
//! durable state goes through the stores, never through the worker.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, OnceCell};
use tracing::{debug, error};
use url::Url;

use crate::backend::Backend;
use crate::cache::{CacheNames, CacheStorage};
use crate::clients::Clients;
use crate::config::{Config, PushConfig};
use crate::event::{EventOutcome, EventScope, WorkerEvent};
use crate::http::Fetcher;
use crate::lifecycle::CacheLifecycle;
use crate::messages::WorkerMessage;
use crate::push::{self, Notifier};
use crate::router::{Dispatcher, Router};
use crate::store::OutboxStore;
use crate::sync::{SyncOrchestrator, SyncTrigger};

struct Inner<S: CacheStorage, F: Fetcher, B: Backend, N: Notifier> {
  lifecycle: CacheLifecycle<S, F>,
  dispatcher: Dispatcher<S, F>,
  sync: SyncOrchestrator<B>,
  clients: Clients,
  notifier: N,
  push: PushConfig,
  origin: Url,
}

/// Routes events to the lifecycle, the dispatcher, the orchestrator and
/// the push bridge.
pub struct Worker<S: CacheStorage, F: Fetcher, B: Backend, N: Notifier> {
  inner: Arc<Inner<S, F, B, N>>,
}

impl<S: CacheStorage, F: Fetcher, B: Backend, N: Notifier> Clone for Worker<S, F, B, N> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S: CacheStorage, F: Fetcher, B: Backend, N: Notifier> Worker<S, F, B, N> {
  pub fn new(
    config: &Config,
    storage: Arc<S>,
    fetcher: Arc<F>,
    store: Arc<OutboxStore>,
    backend: Arc<B>,
    clients: Clients,
    notifier: N,
  ) -> Result<Self> {
    let names = CacheNames::new(config.build_version.clone());
    let router = Router::new(config.origin.clone(), config.shell.clone(), &config.routes);
    let dispatcher = Dispatcher::new(
      router,
      storage.clone(),
      fetcher.clone(),
      names.clone(),
      &config.routes,
    )?;
    let lifecycle = CacheLifecycle::new(
      storage,
      fetcher,
      clients.clone(),
      names,
      config.origin.clone(),
      config.shell.clone(),
    );
    let sync = SyncOrchestrator::new(store, backend, clients.clone(), config.sync_tag.clone())
      .with_lease_ttl(chrono::Duration::seconds(config.flush_lease_secs));

    Ok(Self {
      inner: Arc::new(Inner {
        lifecycle,
        dispatcher,
        sync,
        clients,
        notifier,
        push: config.push.clone(),
        origin: config.origin.clone(),
      }),
    })
  }

  /// Handle one event to completion.
  ///
  /// Extended work is always awaited, whether the handler succeeded or
  /// not. Errors are logged here and returned to whoever dispatched.
  pub async fn handle(&self, event: WorkerEvent) -> Result<EventOutcome> {
    let (result, scope) = self.start(event).await;
    scope.settle().await;
    result
  }

  /// Run the handler, leaving its extended work pending in the scope.
  async fn start(&self, event: WorkerEvent) -> (Result<EventOutcome>, EventScope) {
    let name = event.name();
    debug!(event = name, "handling event");

    let mut scope = EventScope::new();
    let result = self.route(event, &mut scope).await;
    if let Err(e) = &result {
      error!(event = name, error = %e, "event handler failed");
    }
    (result, scope)
  }

  async fn route(&self, event: WorkerEvent, scope: &mut EventScope) -> Result<EventOutcome> {
    let inner = &self.inner;

    let outcome = match event {
      WorkerEvent::Install => EventOutcome::Installed(inner.lifecycle.install().await?),
      WorkerEvent::Activate => EventOutcome::Activated(inner.lifecycle.activate().await?),
      WorkerEvent::Fetch(request) => {
        EventOutcome::Responded(inner.dispatcher.respond(&request, scope).await?)
      }
      WorkerEvent::Sync { tag } => {
        EventOutcome::Flushed(inner.sync.flush(SyncTrigger::BackgroundSync { tag }).await?)
      }
      WorkerEvent::Message(WorkerMessage::SyncRequested { .. }) => {
        EventOutcome::Flushed(inner.sync.flush(SyncTrigger::UserRequested).await?)
      }
      WorkerEvent::Push(payload) => {
        let notification = push::render(payload.as_deref(), &inner.push);
        inner.notifier.show(&notification);
        EventOutcome::Notified(notification)
      }
      WorkerEvent::NotificationClick {
        notification,
        action,
      } => EventOutcome::Clicked(push::route_click(
        &inner.clients,
        &inner.origin,
        &notification,
        action.as_deref(),
      )),
    };

    Ok(outcome)
  }

  /// Run the mailbox loop. Each event gets its own task, so a slow flush
  /// never blocks fetches. The reply goes out as soon as the handler has
  /// an outcome; the task then stays alive until extended work settles.
  pub fn spawn(self) -> WorkerHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    tokio::spawn(async move {
      while let Some((event, reply)) = rx.recv().await {
        let worker = self.clone();
        tokio::spawn(async move {
          let (result, scope) = worker.start(event).await;
          // The dispatcher may have stopped waiting
          let _ = reply.send(result);
          scope.settle().await;
        });
      }
      debug!("worker mailbox closed");
    });

    WorkerHandle { tx }
  }
}

type Envelope = (WorkerEvent, oneshot::Sender<Result<EventOutcome>>);

/// Cloneable sender into a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
  tx: mpsc::UnboundedSender<Envelope>,
}

impl WorkerHandle {
  /// Deliver an event and wait for its outcome.
  pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send((event, reply))
      .map_err(|_| eyre!("Worker is not running"))?;
    rx.await.map_err(|_| eyre!("Worker dropped the event"))?
  }
}

/// Idempotent worker registration.
///
/// Concurrent callers share one initialization; later callers get the
/// handle it produced. A failed initialization can be retried.
#[derive(Default)]
pub struct Registration {
  handle: OnceCell<WorkerHandle>,
}

impl Registration {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn register<I, Fut>(&self, init: I) -> Result<WorkerHandle>
  where
    I: FnOnce() -> Fut,
    Fut: Future<Output = Result<WorkerHandle>>,
  {
    self.handle.get_or_try_init(init).await.cloned()
  }

  pub fn get(&self) -> Option<WorkerHandle> {
    self.handle.get().cloned()
  }
}
