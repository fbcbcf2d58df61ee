mod app;
mod backend;
mod cache;
mod clients;
mod commands;
mod config;
mod connectivity;
mod error;
mod event;
mod http;
mod lifecycle;
mod logging;
mod messages;
mod push;
mod router;
mod store;
mod sync;
mod tab;
#[cfg(test)]
mod testing;
mod worker;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "outpost")]
#[command(about = "Offline content cache and durable write-back outbox for a web origin")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/outpost/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Directory holding cache.db and outbox.db
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Base URL of the backend endpoints
  #[arg(long, global = true)]
  backend_url: Option<String>,

  /// Build version used to name cache generations
  #[arg(long, global = true)]
  build_version: Option<String>,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.log_file.as_deref())?;

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Command-line flags win over the file
  if let Some(url) = &args.backend_url {
    config = config.with_backend_url(url)?;
  }
  if let Some(version) = args.build_version {
    config.build_version = version;
  }
  if let Some(dir) = args.data_dir {
    config.data_dir = Some(dir);
  }

  let app = app::App::new(config)?;
  app.run(args.command).await?;

  Ok(())
}
