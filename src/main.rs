mod cache;
mod config;
mod connectivity;
mod event;
mod logging;
mod notify;
mod store;
mod sync;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

use cache::{
  spawn_worker, CacheLayer, CacheStorage, ClientMessage, HttpFetcher, NoopStorage, Request,
  SqliteCacheStorage, WorkerHandle,
};
use config::Config;
use connectivity::Connectivity;
use event::{Trigger, TriggerHandler};
use store::{Domain, RecordId, RecordStore, SqliteStore, Status};
use sync::{Submitters, SyncOrchestrator, SyncOutcome};

#[derive(Parser, Debug)]
#[command(name = "floorsync")]
#[command(about = "Offline-first queue and sync for warehouse floor operations")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/floorsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Queue a record for the next sync pass
  Enqueue {
    domain: Domain,
    /// Record payload as JSON
    payload: String,
  },
  /// Print the records of a domain, one JSON object per line
  List {
    domain: Domain,
    #[arg(short, long)]
    status: Option<Status>,
    /// Only records created by this owner
    #[arg(short, long)]
    owner: Option<String>,
  },
  /// Print a single record
  Show { domain: Domain, id: RecordId },
  Count {
    domain: Domain,
    #[arg(short, long)]
    status: Option<Status>,
  },
  /// Remove a single record
  Delete { domain: Domain, id: RecordId },
  /// Remove every record in a domain
  Clear { domain: Domain },
  /// Run a single sync pass now
  Sync,
  /// Move failed records back to pending
  RetryFailed { domain: Option<Domain> },
  /// Drop synced records older than the retention window
  Purge {
    /// Overrides sync.retention_days
    #[arg(long)]
    days: Option<u32>,
  },
  /// Fetch a URL through the response cache
  Fetch {
    url: Url,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Manage the response cache
  #[command(subcommand)]
  Cache(CacheCommand),
  /// Keep syncing in the background until interrupted. SIGUSR1 requests a pass.
  Daemon,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Delete every cache partition
  Clear,
  /// Fetch and store specific URLs
  Prime { urls: Vec<Url> },
  /// Install the current version and drop older ones
  Activate,
  /// Entry count per partition
  Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let data_dir = config.data_dir()?;
  std::fs::create_dir_all(&data_dir)
    .map_err(|e| eyre!("Failed to create data directory {}: {}", data_dir.display(), e))?;
  let _log_guard = logging::init(&config.log_dir()?)?;

  match args.command {
    Command::Enqueue { domain, payload } => {
      let payload: serde_json::Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;
      let record = open_store(&config)?.add(domain, payload)?;
      println!("{}", record.id);
    }
    Command::List {
      domain,
      status,
      owner,
    } => {
      let store = open_store(&config)?;
      let records = match (status, owner) {
        (status, Some(owner)) => store.get_all_matching(domain, |r| {
          r.owner_id == owner && status.map_or(true, |s| r.status == s)
        })?,
        (Some(status), None) => store.get_by_status(domain, status)?,
        (None, None) => store.get_all(domain)?,
      };
      let mut stdout = std::io::stdout().lock();
      for record in records {
        writeln!(stdout, "{}", serde_json::to_string(&record)?)?;
      }
    }
    Command::Show { domain, id } => {
      let record = open_store(&config)?
        .get(domain, id)?
        .ok_or_else(|| eyre!("No record {} in {}", id, domain))?;
      println!("{}", serde_json::to_string_pretty(&record)?);
    }
    Command::Count { domain, status } => {
      println!("{}", open_store(&config)?.count(domain, status)?);
    }
    Command::Delete { domain, id } => {
      if !open_store(&config)?.delete(domain, id)? {
        return Err(eyre!("No record {} in {}", id, domain));
      }
      println!("Deleted {} record {}", domain, id);
    }
    Command::Clear { domain } => {
      println!("Removed {} {} records", open_store(&config)?.clear(domain)?, domain);
    }
    Command::Sync => {
      let orchestrator = build_orchestrator(&config, Arc::new(open_store(&config)?))?;
      match orchestrator.sync_all().await {
        SyncOutcome::Completed(summary) => {
          println!("{}", notify::summary_message(summary.synced(), summary.failed()));
          for (domain, result) in &summary.per_domain {
            println!(
              "  {:<10} {} synced, {} failed, {} total",
              domain.as_str(), result.synced, result.failed, result.total
            );
          }
        }
        SyncOutcome::Skipped => {
          println!("Sync already in progress; send SIGUSR1 to a running daemon instead")
        }
        SyncOutcome::Failed(error) => return Err(eyre!("Sync failed: {}", error)),
      }
    }
    Command::RetryFailed { domain } => {
      let orchestrator = build_orchestrator(&config, Arc::new(open_store(&config)?))?;
      println!("Requeued {} records", orchestrator.retry_failed(domain)?);
    }
    Command::Purge { days } => {
      let days = days.unwrap_or(config.sync.retention_days);
      let purged = store::purge_expired(&open_store(&config)?, days, Utc::now())?;
      println!("Purged {} synced records older than {} days", purged, days);
    }
    Command::Fetch { url, navigate } => {
      let request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };
      let (_online, online) = watch::channel(true);
      let (worker, task) = spawn_cache_worker(&config, online)?;

      let result = worker.fetch(request).await?;
      match result.cached_at {
        Some(cached_at) => eprintln!(
          "{} ({:?}, cached {})",
          result.response.status, result.source, cached_at
        ),
        None => eprintln!("{} ({:?})", result.response.status, result.source),
      }
      std::io::stdout().lock().write_all(&result.response.body)?;

      // Let the background refresh land before the process exits
      if let Some(revalidation) = result.revalidation {
        let _ = revalidation.await;
      }
      stop_worker(worker, task).await;
    }
    Command::Cache(command) => {
      let (_online, online) = watch::channel(true);
      let (worker, task) = spawn_cache_worker(&config, online)?;
      let mut messages = worker.subscribe();

      match command {
        CacheCommand::Clear => {
          worker.clear_cache()?;
          wait_for(&mut messages, |m| matches!(m, ClientMessage::CacheCleared)).await?;
          println!("Cache cleared");
        }
        CacheCommand::Prime { urls } => {
          worker.cache_urls(urls)?;
          if let ClientMessage::UrlsCached { cached, failed } = wait_for(&mut messages, |m| {
            matches!(m, ClientMessage::UrlsCached { .. })
          })
          .await?
          {
            println!("Cached {} URLs, {} failed", cached, failed);
          }
        }
        CacheCommand::Activate => {
          let installed = worker.install().await?;
          println!(
            "Installed {} assets, {} failed",
            installed.cached, installed.failed
          );
          for name in installed.dropped {
            println!("Deleted outdated cache {}", name);
          }
        }
        CacheCommand::Stats => {
          for (partition, entries) in worker.stats().await? {
            println!("{:<8} {}", partition.as_str(), entries);
          }
        }
      }
      stop_worker(worker, task).await;
    }
    Command::Daemon => run_daemon(config).await?,
  }

  Ok(())
}

fn open_store(config: &Config) -> Result<SqliteStore> {
  Ok(SqliteStore::open(&config.store_path()?, config.owner_id.clone())?)
}

fn build_orchestrator(
  config: &Config,
  store: Arc<SqliteStore>,
) -> Result<SyncOrchestrator<SqliteStore>> {
  let client = reqwest::Client::builder()
    .timeout(config.sync.submit_timeout())
    .build()
    .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

  let submitters = Submitters::from_endpoints(&client, &config.sync.endpoints);
  if submitters.is_empty() {
    warn!("No sync endpoints configured, records will stay pending");
  }

  Ok(SyncOrchestrator::new(store, submitters).with_submit_timeout(config.sync.submit_timeout()))
}

fn build_layer<S>(config: &Config, storage: Arc<S>) -> Result<CacheLayer<S, HttpFetcher>>
where
  S: CacheStorage + 'static,
{
  let fetcher = Arc::new(HttpFetcher::new(config.cache.fetch_timeout())?);
  Ok(CacheLayer::new(storage, fetcher, config.cache.policy()?))
}

/// Start the cache worker over on-disk storage, or over nothing when caching
/// is disabled.
fn spawn_cache_worker(
  config: &Config,
  online: watch::Receiver<bool>,
) -> Result<(WorkerHandle, JoinHandle<()>)> {
  if config.cache.enabled {
    let storage = Arc::new(SqliteCacheStorage::open(&config.cache_path()?)?);
    Ok(spawn_worker(build_layer(config, storage)?, online))
  } else {
    Ok(spawn_worker(build_layer(config, Arc::new(NoopStorage))?, online))
  }
}

async fn stop_worker(worker: WorkerHandle, task: JoinHandle<()>) {
  drop(worker);
  let _ = task.await;
}

async fn wait_for<P>(
  messages: &mut broadcast::Receiver<ClientMessage>,
  wanted: P,
) -> Result<ClientMessage>
where
  P: Fn(&ClientMessage) -> bool,
{
  loop {
    match messages.recv().await {
      Ok(message) if wanted(&message) => return Ok(message),
      Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
      Err(broadcast::error::RecvError::Closed) => {
        return Err(eyre!("Cache worker stopped before answering"))
      }
    }
  }
}

/// Turn SIGUSR1 into manual sync requests.
#[cfg(unix)]
fn spawn_manual_trigger(triggers: mpsc::UnboundedSender<Trigger>) -> Result<JoinHandle<()>> {
  use tokio::signal::unix::{signal, SignalKind};

  let mut requests = signal(SignalKind::user_defined1())
    .map_err(|e| eyre!("Failed to listen for SIGUSR1: {}", e))?;

  Ok(tokio::spawn(async move {
    while requests.recv().await.is_some() {
      info!("Manual sync requested");
      if triggers.send(Trigger::Manual).is_err() {
        break;
      }
    }
  }))
}

async fn run_daemon(config: Config) -> Result<()> {
  let store = Arc::new(open_store(&config)?);
  let orchestrator = Arc::new(build_orchestrator(&config, store.clone())?);

  let purged = store::purge_expired(store.as_ref(), config.sync.retention_days, Utc::now())?;
  if purged > 0 {
    info!(purged, "Retention sweep");
  }

  // Connectivity
  let connectivity = Arc::new(Connectivity::new(false));
  let probe_client = reqwest::Client::builder()
    .timeout(config.cache.fetch_timeout())
    .build()
    .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;
  let probe = connectivity.clone().spawn_probe(
    probe_client,
    config.cache.origin()?,
    config.cache.probe_interval(),
  );

  // Cache worker
  let (worker, worker_task) = spawn_cache_worker(&config, connectivity.subscribe())?;
  let installed = worker.install().await?;
  info!(
    cached = installed.cached,
    failed = installed.failed,
    dropped = installed.dropped.len(),
    "Cache installed"
  );

  // Sync triggers
  let triggers = TriggerHandler::new(config.sync.interval(), connectivity.subscribe());
  #[cfg(unix)]
  let manual = spawn_manual_trigger(triggers.sender())?;
  tokio::spawn(event::forward_worker_messages(
    worker.subscribe(),
    triggers.sender(),
  ));
  tokio::spawn(notify::run_notifier(
    config.notifications.clone(),
    orchestrator.subscribe(),
  ));
  let agent = tokio::spawn(sync::run_sync_agent(
    orchestrator,
    triggers,
    connectivity.subscribe(),
  ));

  info!(owner = %config.owner_id, "Daemon started");
  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for shutdown signal: {}", e))?;
  info!("Shutting down");

  probe.abort();
  #[cfg(unix)]
  manual.abort();
  agent.abort();
  stop_worker(worker, worker_task).await;

  Ok(())
}
