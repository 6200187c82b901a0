use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use tracker_sync::cache::CacheStore;
use tracker_sync::clock::SystemClock;
use tracker_sync::config::{Config, LogConfig, StorageBackend};
use tracker_sync::event::EventHandler;
use tracker_sync::fetch::Fetcher;
use tracker_sync::invalidation::InvalidationGraph;
use tracker_sync::metrics::{MetricsCollector, MetricsExport};
use tracker_sync::network::{Connectivity, HttpTransport, Transport};
use tracker_sync::queue::{FailureNotice, OfflineQueue, QueueDeps, QueueItem};
use tracker_sync::scheduler::TokioScheduler;
use tracker_sync::storage::{KeyValueStorage, MemoryStorage, NoopStorage, SqliteStorage};
use tracker_sync::{SyncClient, SyncCoordinator, SyncSettings};

#[derive(Parser, Debug)]
#[command(name = "tracker-sync")]
#[command(about = "Offline-resilient cache and sync engine for the interview tracker")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tracker-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
  /// Run the sync loop until interrupted
  Run,
  /// Print metrics, queue depth and unacknowledged failures as JSON
  Status,
  /// Replay the offline queue once
  Drain,
  /// Remove expired cache entries
  Sweep,
  /// Remove every cache entry
  Clear,
}

#[derive(Serialize)]
struct Status {
  metrics: MetricsExport,
  queue: Vec<QueueItem>,
  pending_failures: Vec<FailureNotice>,
}

/// Everything wired together for one process.
struct Engine {
  config: Config,
  cache: Arc<CacheStore>,
  transport: Arc<dyn Transport>,
  connectivity: Connectivity,
  queue: Arc<OfflineQueue>,
  fetcher: Fetcher,
  client: SyncClient,
}

impl Engine {
  fn new(config: Config) -> Result<Self> {
    let storage = open_storage(&config);
    let clock = Arc::new(SystemClock);
    let metrics = Arc::new(MetricsCollector::new(config.metrics.window_size));
    let cache = Arc::new(CacheStore::new(
      storage.clone(),
      clock.clone(),
      &config.cache.schema_version,
      metrics.clone(),
    ));
    let invalidation = Arc::new(InvalidationGraph::new(
      config.invalidation_rules(),
      cache.clone(),
    ));
    let transport: Arc<dyn Transport> =
      Arc::new(HttpTransport::new(&config.api, Config::get_api_token())?);
    let connectivity = Connectivity::default();

    let queue = Arc::new(OfflineQueue::open(QueueDeps {
      storage,
      cache: cache.clone(),
      invalidation: invalidation.clone(),
      transport: transport.clone(),
      connectivity: connectivity.clone(),
      clock,
      metrics: metrics.clone(),
      retry: config.retry.clone(),
    }));
    let fetcher = Fetcher::new(
      cache.clone(),
      transport.clone(),
      connectivity.clone(),
      metrics.clone(),
      config.retry.clone(),
    );
    let client = SyncClient::new(
      cache.clone(),
      fetcher.clone(),
      queue.clone(),
      invalidation,
      metrics,
      connectivity.clone(),
    )
    .with_default_ttl(config.cache.default_ttl());

    Ok(Self {
      config,
      cache,
      transport,
      connectivity,
      queue,
      fetcher,
      client,
    })
  }

  fn coordinator(&self, events: &EventHandler) -> SyncCoordinator {
    SyncCoordinator::new(
      self.fetcher.clone(),
      self.queue.clone(),
      self.cache.clone(),
      self.transport.clone(),
      self.connectivity.clone(),
      Arc::new(TokioScheduler),
      events.sender(),
      SyncSettings::from_config(&self.config),
    )
  }
}

/// The configured backend. SQLite falls back to memory when it cannot be opened.
fn open_storage(config: &Config) -> Arc<dyn KeyValueStorage> {
  match config.cache.backend {
    StorageBackend::Memory => return Arc::new(MemoryStorage::new()),
    StorageBackend::Disabled => return Arc::new(NoopStorage),
    StorageBackend::Sqlite => {}
  }
  match SqliteStorage::open(config.cache.path.as_deref()) {
    Ok(storage) => Arc::new(storage),
    Err(e) => {
      warn!(error = %e, "Persistent storage unavailable, using in-memory store");
      Arc::new(MemoryStorage::new())
    }
  }
}

fn init_logging(log: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  match &log.dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "tracker-sync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
      Ok(None)
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_logging(&config.log)?;

  let engine = Engine::new(config)?;

  match args.command.unwrap_or(Command::Run) {
    Command::Run => {
      let events = EventHandler::new();
      let coordinator = engine.coordinator(&events);
      let shutdown = events.sender();
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          info!("Interrupted, shutting down");
          shutdown.shutdown();
        }
      });
      coordinator.run(events).await?;
    }
    Command::Status => {
      let status = Status {
        metrics: engine.client.export_metrics(),
        queue: engine.queue.items(),
        pending_failures: engine.client.pending_failures(),
      };
      println!("{}", serde_json::to_string_pretty(&status)?);
    }
    Command::Drain => {
      let report = engine.queue.drain().await;
      println!(
        "succeeded: {}, failed: {}, remaining: {}",
        report.succeeded.len(),
        report.failed.len(),
        engine.queue.depth()
      );
    }
    Command::Sweep => {
      let events = EventHandler::new();
      let removed = engine.coordinator(&events).sweep();
      println!("removed {} expired entries", removed);
    }
    Command::Clear => {
      let removed = engine.cache.clear_all();
      println!("removed {} cache entries", removed);
    }
  }

  Ok(())
}
