mod app;
mod clients;
mod commands;
mod config;
mod data_cache;
mod event;
mod host;
mod http;
mod net;
mod queue;
mod reconcile;
mod store;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "swcache")]
#[command(about = "Offline cache and version reconciliation for PWA-style clients")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/swcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Origin the clients are served from
  #[arg(short, long, global = true)]
  origin: Option<Url>,

  /// Also write daily-rotated logs into this directory
  #[arg(long, global = true)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
  /// Install the configured generation and activate it
  Install,
  /// Run a request through the worker
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: http::Method,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Run one version reconciliation
  Check,
  /// Keep polling the version endpoint and accept console commands
  Watch,
  /// Delete every cache generation
  Clear,
  /// Show version, generations and queued writes
  Status,
  /// Inspect or replay writes queued while offline
  Queue {
    #[command(subcommand)]
    action: QueueCmd,
  },
}

#[derive(Subcommand, Debug)]
enum QueueCmd {
  List,
  Flush,
}

fn init_tracing(log_dir: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)?;
      let file_appender = tracing_appender::rolling::daily(dir, "swcache.log");
      let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
      let layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(env_filter)
    .with(stderr_layer)
    .with(file_layer)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Keep the guard alive so buffered log lines are flushed on exit
  let _guard = init_tracing(args.log_dir.as_ref())?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    config::Config { origin, ..config }
  } else {
    config
  };

  let app = app::App::new(config)?;

  match args.command {
    Cmd::Install => {
      let report = app.install().await?;
      println!(
        "installed; deleted {} stale generation(s), claimed {} client(s)",
        report.deleted.len(),
        report.claimed
      );
    }
    Cmd::Fetch { url, method, data } => {
      let fetched = app.fetch(method, &url, data).await?;
      eprintln!(
        "{} {} ({:?}, {})",
        fetched.response.status,
        fetched.response.status_text,
        fetched.source,
        fetched.response.header("content-type").unwrap_or("no content type")
      );
      println!("{}", fetched.response.text());
    }
    Cmd::Check => println!("{:?}", app.check().await?),
    Cmd::Watch => app.watch().await?,
    Cmd::Clear => println!("{:?}", app.clear().await?),
    Cmd::Status => println!("{}", app.status().await?),
    Cmd::Queue { action } => match action {
      QueueCmd::List => {
        for action in app.queue_list().await? {
          println!(
            "#{} {} {} {}",
            action.id,
            action.queued_at.to_rfc3339(),
            action.method,
            action.url
          );
        }
      }
      QueueCmd::Flush => {
        let report = app.queue_flush().await?;
        println!("replayed {} ({} failed)", report.sent, report.failed);
      }
    },
  }

  app.shutdown().await;
  Ok(())
}
