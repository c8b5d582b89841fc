//! Isolated task hosting the cache layer.
//!
//! Pages never touch the layer directly. Everything crossing the boundary is a
//! message: requests go in over an mpsc channel, notices for every page come
//! back over a broadcast channel.

use color_eyre::{eyre::eyre, Result};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use super::fetch::Fetcher;
use super::layer::CacheLayer;
use super::storage::CacheStorage;
use super::traits::{CacheResult, Partition, Request};

const CLIENT_CAPACITY: usize = 32;

/// Outcome of installing the current version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
  pub cached: usize,
  pub failed: usize,
  /// Caches from older versions that were deleted
  pub dropped: Vec<String>,
}

/// Page → worker
#[derive(Debug)]
pub enum WorkerRequest {
  Fetch {
    request: Request,
    reply: oneshot::Sender<CacheResult>,
  },
  /// Precache the static manifest and drop older versions. Later requests
  /// wait until this finishes.
  Install { reply: oneshot::Sender<Installed> },
  /// Drop every partition
  ClearCache,
  /// Prime specific URLs
  CacheUrls(Vec<Url>),
  /// Entry count per partition of the current version
  Stats {
    reply: oneshot::Sender<Vec<(Partition, usize)>>,
  },
}

/// Worker → every page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
  SyncOfflineData,
  CacheCleared,
  UrlsCached { cached: usize, failed: usize },
}

/// Page-side end of the worker channels.
#[derive(Clone)]
pub struct WorkerHandle {
  tx: mpsc::UnboundedSender<WorkerRequest>,
  clients: broadcast::Sender<ClientMessage>,
}

impl WorkerHandle {
  /// Route a request through the worker and wait for its response.
  pub async fn fetch(&self, request: Request) -> Result<CacheResult> {
    let (reply, rx) = oneshot::channel();
    self.send(WorkerRequest::Fetch { request, reply })?;
    rx.await
      .map_err(|_| eyre!("Cache worker dropped the request"))
  }

  pub async fn install(&self) -> Result<Installed> {
    let (reply, rx) = oneshot::channel();
    self.send(WorkerRequest::Install { reply })?;
    rx.await
      .map_err(|_| eyre!("Cache worker stopped before installing"))
  }

  /// Answered with `ClientMessage::CacheCleared` to every page.
  pub fn clear_cache(&self) -> Result<()> {
    self.send(WorkerRequest::ClearCache)
  }

  /// Answered with `ClientMessage::UrlsCached` to every page.
  pub fn cache_urls(&self, urls: Vec<Url>) -> Result<()> {
    self.send(WorkerRequest::CacheUrls(urls))
  }

  pub async fn stats(&self) -> Result<Vec<(Partition, usize)>> {
    let (reply, rx) = oneshot::channel();
    self.send(WorkerRequest::Stats { reply })?;
    rx.await
      .map_err(|_| eyre!("Cache worker dropped the request"))
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ClientMessage> {
    self.clients.subscribe()
  }

  fn send(&self, request: WorkerRequest) -> Result<()> {
    self
      .tx
      .send(request)
      .map_err(|_| eyre!("Cache worker is not running"))
  }
}

/// Serve messages for `layer` until every handle is dropped.
///
/// When `online` flips from offline to online every page is told to sync.
pub fn spawn_worker<S, F>(
  layer: CacheLayer<S, F>,
  mut online: watch::Receiver<bool>,
) -> (WorkerHandle, JoinHandle<()>)
where
  S: CacheStorage + 'static,
  F: Fetcher,
{
  let (tx, mut rx) = mpsc::unbounded_channel();
  let (clients, _) = broadcast::channel(CLIENT_CAPACITY);
  let handle = WorkerHandle {
    tx,
    clients: clients.clone(),
  };

  let mut was_online = *online.borrow_and_update();

  let task = tokio::spawn(async move {
    loop {
      tokio::select! {
        message = rx.recv() => {
          let Some(message) = message else { break };
          handle_message(&layer, &clients, message).await;
        }
        Ok(()) = online.changed() => {
          let now_online = *online.borrow_and_update();
          if now_online && !was_online {
            info!("Connectivity restored, asking pages to sync");
            let _ = clients.send(ClientMessage::SyncOfflineData);
          }
          was_online = now_online;
        }
      }
    }

    debug!("Cache worker stopped");
  });

  (handle, task)
}

async fn handle_message<S, F>(
  layer: &CacheLayer<S, F>,
  clients: &broadcast::Sender<ClientMessage>,
  message: WorkerRequest,
) where
  S: CacheStorage + 'static,
  F: Fetcher,
{
  match message {
    WorkerRequest::Fetch { request, reply } => {
      // Requests are served concurrently, like independent fetch events
      let layer = layer.clone();
      tokio::spawn(async move {
        let result = layer.handle(request).await;
        let _ = reply.send(result);
      });
    }
    WorkerRequest::Install { reply } => {
      let (cached, failed) = layer.install().await;
      let dropped = layer.activate();
      let _ = reply.send(Installed {
        cached,
        failed,
        dropped,
      });
    }
    WorkerRequest::ClearCache => {
      let dropped = layer.clear();
      info!(dropped, "Cleared caches on request");
      let _ = clients.send(ClientMessage::CacheCleared);
    }
    WorkerRequest::CacheUrls(urls) => {
      let layer = layer.clone();
      let clients = clients.clone();
      tokio::spawn(async move {
        let (cached, failed) = layer.prime(&urls).await;
        let _ = clients.send(ClientMessage::UrlsCached { cached, failed });
      });
    }
    WorkerRequest::Stats { reply } => {
      let stats = Partition::ALL
        .iter()
        .map(|p| (*p, layer.partition_len(*p)))
        .collect();
      let _ = reply.send(stats);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::layer::{CachePolicy, PartitionLimits};
  use crate::cache::storage::SqliteCacheStorage;
  use crate::cache::traits::{CacheSource, Response};
  use async_trait::async_trait;
  use std::sync::Arc;
  use std::time::Duration;

  struct StaticFetcher;

  #[async_trait]
  impl Fetcher for StaticFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
      Ok(Response {
        status: 200,
        content_type: None,
        body: request.url.path().as_bytes().to_vec(),
      })
    }
  }

  fn start(
    online: watch::Receiver<bool>,
  ) -> (WorkerHandle, CacheLayer<SqliteCacheStorage, StaticFetcher>) {
    let layer = CacheLayer::new(
      Arc::new(SqliteCacheStorage::open_in_memory().unwrap()),
      Arc::new(StaticFetcher),
      CachePolicy {
        version: "v1".into(),
        origin: Url::parse("https://wms.local").unwrap(),
        limits: PartitionLimits::default(),
        static_assets: vec!["/app.js".into()],
        offline_page: None,
      },
    );
    let (handle, _task) = spawn_worker(layer.clone(), online);
    (handle, layer)
  }

  async fn next(rx: &mut broadcast::Receiver<ClientMessage>) -> ClientMessage {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
      .await
      .expect("no message from worker")
      .unwrap()
  }

  #[tokio::test]
  async fn test_fetch_round_trips_through_worker() {
    let (_tx, online) = watch::channel(true);
    let (handle, layer) = start(online);

    let url = Url::parse("https://wms.local/api/bins").unwrap();
    let first = handle.fetch(Request::get(url.clone())).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);

    let second = handle.fetch(Request::get(url)).await.unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(layer.partition_len(Partition::Dynamic), 1);
  }

  #[tokio::test]
  async fn test_connectivity_restore_broadcasts_sync() {
    let (tx, online) = watch::channel(false);
    let (handle, _layer) = start(online);
    let mut messages = handle.subscribe();

    tx.send(true).unwrap();

    assert_eq!(next(&mut messages).await, ClientMessage::SyncOfflineData);
  }

  #[tokio::test]
  async fn test_clear_and_prime_messages() {
    let (_tx, online) = watch::channel(true);
    let (handle, layer) = start(online);
    let mut messages = handle.subscribe();

    handle
      .cache_urls(vec![
        Url::parse("https://wms.local/img/a.png").unwrap(),
        Url::parse("https://wms.local/api/zones").unwrap(),
      ])
      .unwrap();
    assert_eq!(
      next(&mut messages).await,
      ClientMessage::UrlsCached {
        cached: 2,
        failed: 0
      }
    );
    assert_eq!(layer.partition_len(Partition::Image), 1);

    let stats = handle.stats().await.unwrap();
    assert!(stats.contains(&(Partition::Image, 1)));
    assert!(stats.contains(&(Partition::Dynamic, 1)));

    handle.clear_cache().unwrap();
    assert_eq!(next(&mut messages).await, ClientMessage::CacheCleared);
    assert_eq!(layer.partition_len(Partition::Image), 0);
  }

  #[tokio::test]
  async fn test_install_precaches_and_drops_old_versions() {
    let (_tx, online) = watch::channel(true);
    let (handle, layer) = start(online);

    let installed = handle.install().await.unwrap();
    assert_eq!(installed.cached, 1);
    assert_eq!(installed.failed, 0);
    assert!(installed.dropped.is_empty());
    assert_eq!(layer.partition_len(Partition::Static), 1);

    let hit = handle
      .fetch(Request::get(Url::parse("https://wms.local/app.js").unwrap()))
      .await
      .unwrap();
    assert_eq!(hit.source, CacheSource::Cache);
  }
}
