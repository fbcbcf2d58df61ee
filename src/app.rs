use crate::backend::{Backend, HttpBackend};
use crate::cache::SqliteStorage;
use crate::clients::Clients;
use crate::commands::{Command, TabCommand, TAB_COMMANDS};
use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::event::{EventOutcome, WorkerEvent};
use crate::http::{Gated, HttpFetcher, Request};
use crate::messages::{ClientMessage, WorkerMessage};
use crate::push::{LogNotifier, Notification};
use crate::store::OutboxStore;
use crate::tab::{SubmitOutcome, SyncRequester, Tab};
use crate::worker::{Registration, Worker, WorkerHandle};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

type AppFetcher = Gated<HttpFetcher>;
type AppBackend = Gated<HttpBackend>;
type AppWorker = Worker<SqliteStorage, AppFetcher, AppBackend, LogNotifier>;

/// Everything one invocation needs: both stores, the network clients
/// and a lazily registered worker.
pub struct App {
  config: Config,
  connectivity: Connectivity,
  clients: Clients,
  storage: Arc<SqliteStorage>,
  store: Arc<OutboxStore>,
  fetcher: Arc<AppFetcher>,
  backend: Arc<AppBackend>,
  registration: Registration,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let data_dir: PathBuf = config.data_dir()?;
    let connectivity = Connectivity::new(true);

    let storage = SqliteStorage::open(&data_dir.join("cache.db"))?;
    let store = OutboxStore::open(&data_dir.join("outbox.db"))?;
    if let Some(lost) = store.open_report().outbox_reset {
      eprintln!(
        "warning: outbox schema was upgraded destructively, {} queued write(s) lost",
        lost
      );
    }

    let fetcher = Gated::new(HttpFetcher::new(config.request_timeout())?, connectivity.clone());
    let backend = Gated::new(
      HttpBackend::new(config.backend_url.clone(), config.request_timeout())?,
      connectivity.clone(),
    );

    info!(data_dir = %data_dir.display(), version = %config.build_version, "opened stores");

    Ok(Self {
      config,
      connectivity,
      clients: Clients::new(),
      storage: Arc::new(storage),
      store: Arc::new(store),
      fetcher: Arc::new(fetcher),
      backend: Arc::new(backend),
      registration: Registration::new(),
    })
  }

  /// Register the worker on first use; later calls share the handle.
  async fn worker(&self) -> Result<WorkerHandle> {
    self
      .registration
      .register(|| async {
        let worker = AppWorker::new(
          &self.config,
          self.storage.clone(),
          self.fetcher.clone(),
          self.store.clone(),
          self.backend.clone(),
          self.clients.clone(),
          LogNotifier,
        )?;
        info!(version = %self.config.build_version, "worker registered");
        Ok(worker.spawn())
      })
      .await
  }

  async fn open_tab(&self) -> Result<Tab<AppBackend>> {
    let worker = self.worker().await?;
    let connection = self.clients.connect(self.config.origin.clone());
    info!(tab = connection.id, "tab opened");

    let mut sync = SyncRequester::new(worker, self.config.sync_tag.clone());
    if !self.config.background_sync {
      sync = sync.without_background_sync();
    }
    Ok(Tab::new(
      self.store.clone(),
      self.backend.clone(),
      self.connectivity.clone(),
      connection,
      sync,
    ))
  }

  pub async fn run(&self, command: Command) -> Result<()> {
    if command.offline() {
      self.connectivity.set_online(false);
    }

    match command {
      Command::Install => self.install().await,
      Command::Activate => self.activate().await,
      Command::Get { path, navigate, .. } => self.get(&path, navigate).await,
      Command::Submit {
        title, note, mirror, ..
      } => self.submit(json!({ "title": title, "note": note }), mirror).await,
      Command::Sync => self.sync().await,
      Command::Post { message } => self.post(&message).await,
      Command::Outbox => print_json(&self.store.read_all()?),
      Command::Entries => print_json(&self.store.list_entries()?),
      Command::DeleteEntry { id } => self.delete_entry(id),
      Command::Push { payload, click } => self.push(payload, click).await,
      Command::Subscribe { subscription } => self.subscribe(&subscription).await,
      Command::PushTest => {
        self.backend.push_test().await?;
        println!("test push requested");
        Ok(())
      }
      Command::Tab => self.interactive_tab().await,
    }
  }

  /// A long-lived tab: stdin drives it, worker messages are printed as
  /// they arrive, and going back online triggers a sync.
  async fn interactive_tab(&self) -> Result<()> {
    let mut tab = self.open_tab().await?;
    let watcher = tab.watch_connectivity();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    enum Step {
      Line(Option<String>),
      Message(Option<ClientMessage>),
    }

    loop {
      let step = tokio::select! {
        line = lines.next_line() => Step::Line(line?),
        message = tab.next_message() => Step::Message(message),
      };

      let line = match step {
        Step::Message(Some(message)) => {
          println!("{}", message.to_json()?);
          continue;
        }
        Step::Message(None) | Step::Line(None) => break,
        Step::Line(Some(line)) if line.trim().is_empty() => continue,
        Step::Line(Some(line)) => line,
      };

      match TabCommand::parse(&line) {
        Ok(TabCommand::Online) => self.connectivity.set_online(true),
        Ok(TabCommand::Offline) => self.connectivity.set_online(false),
        Ok(TabCommand::Sync) => println!("{:?}", tab.request_sync().await?),
        Ok(TabCommand::Entries) => print_json(&self.store.list_entries()?)?,
        Ok(TabCommand::Submit { title, note }) => {
          match tab.submit(&json!({ "title": title, "note": note })).await {
            Ok(SubmitOutcome::Sent) => println!("sent"),
            Ok(SubmitOutcome::Queued(q)) => println!("queued as outbox item {}", q.outbox_id),
            Err(e) => eprintln!("error: {}", e),
          }
        }
        Ok(TabCommand::Help) => {
          for (name, aliases, description) in TAB_COMMANDS {
            println!("{:<10} {:<12} {}", name, aliases.join(","), description);
          }
        }
        Ok(TabCommand::Quit) => break,
        Err(msg) => eprintln!("{}", msg),
      }
    }

    watcher.abort();
    Ok(())
  }

  async fn install(&self) -> Result<()> {
    let worker = self.worker().await?;
    match worker.dispatch(WorkerEvent::Install).await? {
      EventOutcome::Installed(report) => {
        println!(
          "installed {} ({} shell resources in {})",
          report.version, report.cached, report.generation
        );
        Ok(())
      }
      other => Err(unexpected(other)),
    }
  }

  async fn activate(&self) -> Result<()> {
    let worker = self.worker().await?;
    match worker.dispatch(WorkerEvent::Activate).await? {
      EventOutcome::Activated(report) => {
        if report.deleted.is_empty() {
          println!("activated {}, no stale generations", self.config.build_version);
        } else {
          println!(
            "activated {}, deleted {}",
            self.config.build_version,
            report.deleted.join(", ")
          );
        }
        Ok(())
      }
      other => Err(unexpected(other)),
    }
  }

  async fn get(&self, path: &str, navigate: bool) -> Result<()> {
    let url = self
      .config
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path {}: {}", path, e))?;
    let request = if navigate { Request::navigate(url) } else { Request::get(url) };

    let worker = self.worker().await?;
    match worker.dispatch(WorkerEvent::Fetch(request)).await? {
      EventOutcome::Responded(served) => {
        eprintln!(
          "{} {} ({:?})",
          served.response.status, served.response.url, served.source
        );
        println!("{}", served.response.text());
        Ok(())
      }
      other => Err(unexpected(other)),
    }
  }

  async fn submit(&self, payload: Value, mirror_sent: bool) -> Result<()> {
    let mut tab = self.open_tab().await?;
    if mirror_sent {
      tab = tab.with_sent_mirror();
    }
    match tab.submit(&payload).await? {
      SubmitOutcome::Sent => println!("sent"),
      SubmitOutcome::Queued(queued) => println!("queued as outbox item {}", queued.outbox_id),
    }
    report_synced(&mut tab);
    Ok(())
  }

  async fn sync(&self) -> Result<()> {
    let mut tab = self.open_tab().await?;
    let outcome = tab.request_sync().await?;
    println!("{:?}", outcome);
    report_synced(&mut tab);
    Ok(())
  }

  async fn post(&self, raw: &str) -> Result<()> {
    let message = WorkerMessage::from_json(raw)?;
    let mut tab = self.open_tab().await?;
    let worker = self.worker().await?;

    match worker.dispatch(WorkerEvent::Message(message)).await? {
      EventOutcome::Flushed(outcome) => println!("{:?}", outcome),
      other => return Err(unexpected(other)),
    }
    report_synced(&mut tab);
    Ok(())
  }

  fn delete_entry(&self, id: i64) -> Result<()> {
    if self.store.delete_entry(id)? {
      println!("deleted entry {}", id);
      Ok(())
    } else {
      Err(eyre!("No entry with id {}", id))
    }
  }

  async fn push(&self, payload: Option<String>, click: Option<Option<String>>) -> Result<()> {
    let worker = self.worker().await?;
    let raw = payload.map(String::into_bytes);

    let notification: Notification = match worker.dispatch(WorkerEvent::Push(raw)).await? {
      EventOutcome::Notified(n) => n,
      other => return Err(unexpected(other)),
    };
    print_json(&notification)?;

    if let Some(action) = click {
      let event = WorkerEvent::NotificationClick {
        notification,
        action,
      };
      match worker.dispatch(event).await? {
        EventOutcome::Clicked(outcome) => println!("{:?}", outcome),
        other => return Err(unexpected(other)),
      }
    }
    Ok(())
  }

  async fn subscribe(&self, raw: &str) -> Result<()> {
    let subscription: Value =
      serde_json::from_str(raw).map_err(|e| eyre!("Subscription is not valid JSON: {}", e))?;
    self.backend.subscribe_push(&subscription).await?;
    println!("subscribed");
    Ok(())
  }
}

fn report_synced(tab: &mut Tab<AppBackend>) {
  while let Some(message) = tab.try_next_message() {
    match message.to_json() {
      Ok(json) => println!("{}", json),
      Err(e) => warn!(error = %e, "could not encode client message"),
    }
  }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn unexpected(outcome: EventOutcome) -> color_eyre::Report {
  eyre!("Unexpected event outcome: {:?}", outcome)
}
