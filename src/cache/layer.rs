//! Cache layer that intercepts requests in front of the network.

use futures::future::join_all;
use reqwest::Method;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::fetch::Fetcher;
use super::storage::CacheStorage;
use super::traits::{cache_key, CacheResult, CacheSource, CachedEntry, Partition, Request, Response};

const IMAGE_EXTENSIONS: &[&str] = &[
  "png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "avif", "bmp",
];

/// Shown to navigations when neither cache nor network can answer.
pub const OFFLINE_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Offline</title></head>
<body>
<h1>You are offline</h1>
<p>Scans, receipts and counts are still being saved on this device
and will sync once the connection is back.</p>
</body>
</html>
"#;

/// Size bounds per partition, in entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLimits {
  pub static_max: usize,
  pub dynamic_max: usize,
  pub image_max: usize,
}

impl PartitionLimits {
  pub fn max(&self, partition: Partition) -> usize {
    match partition {
      Partition::Static => self.static_max,
      Partition::Dynamic => self.dynamic_max,
      Partition::Image => self.image_max,
    }
  }
}

impl Default for PartitionLimits {
  fn default() -> Self {
    Self {
      static_max: 60,
      dynamic_max: 50,
      image_max: 100,
    }
  }
}

/// What the layer caches and where.
#[derive(Debug, Clone)]
pub struct CachePolicy {
  /// Build version namespacing every partition
  pub version: String,
  /// Only requests to this origin are cached
  pub origin: Url,
  pub limits: PartitionLimits,
  /// Paths precached at install and filed under `static`
  pub static_assets: Vec<String>,
  /// Path of the page served to offline navigations, if precached
  pub offline_page: Option<String>,
}

impl CachePolicy {
  /// Pick a partition for a response being cached for the first time.
  pub fn classify(&self, url: &Url) -> Partition {
    let extension = url
      .path_segments()
      .and_then(|mut segments| segments.next_back())
      .and_then(|name| name.rsplit_once('.'))
      .map(|(_, ext)| ext.to_lowercase());

    if extension.is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str())) {
      Partition::Image
    } else if self.static_assets.iter().any(|p| p == url.path()) {
      Partition::Static
    } else {
      Partition::Dynamic
    }
  }

  pub fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin()
  }

  fn cache_names(&self) -> Vec<String> {
    Partition::ALL
      .iter()
      .map(|p| p.cache_name(&self.version))
      .collect()
  }
}

/// Stale-while-revalidate cache over three bounded, versioned partitions.
///
/// A hit is answered from storage at once while a background fetch refreshes
/// the entry. A miss goes to the network and is stored on success. When the
/// network fails the page still gets a response: the offline page for
/// navigations, an empty 503 for everything else.
pub struct CacheLayer<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  policy: Arc<CachePolicy>,
}

impl<S: CacheStorage + 'static, F: Fetcher> CacheLayer<S, F> {
  pub fn new(storage: Arc<S>, fetcher: Arc<F>, policy: CachePolicy) -> Self {
    Self {
      storage,
      fetcher,
      policy: Arc::new(policy),
    }
  }

  /// Answer an intercepted request.
  pub async fn handle(&self, request: Request) -> CacheResult {
    if request.method != Method::GET || !self.policy.is_same_origin(&request.url) {
      return self.passthrough(request).await;
    }

    let key = cache_key(&request.url);
    if let Some((partition, entry)) = self.lookup(&key) {
      debug!(url = %request.url, %partition, "Cache hit");
      let revalidation = self.spawn_revalidation(request, partition);
      return CacheResult::from_cache(entry.response, entry.cached_at, revalidation);
    }

    match self.fetcher.fetch(&request).await {
      Ok(response) => {
        if response.is_success() {
          let partition = self.policy.classify(&request.url);
          self.store(partition, &request.url, &response);
        }
        CacheResult::from_network(response)
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Network fetch failed");
        self.offline_response(&request)
      }
    }
  }

  /// Precache the static manifest (and the offline page) for this version.
  ///
  /// Returns `(cached, failed)`. A failing asset doesn't stop the others.
  pub async fn install(&self) -> (usize, usize) {
    let mut paths = self.policy.static_assets.clone();
    if let Some(page) = &self.policy.offline_page {
      if !paths.contains(page) {
        paths.push(page.clone());
      }
    }

    let urls: Vec<Url> = paths
      .iter()
      .filter_map(|p| match self.policy.origin.join(p) {
        Ok(url) => Some(url),
        Err(e) => {
          warn!(path = %p, error = %e, "Skipping invalid static asset path");
          None
        }
      })
      .collect();

    let results = join_all(
      urls
        .iter()
        .map(|url| self.fetch_into(Partition::Static, url)),
    )
    .await;

    let cached = results.iter().filter(|ok| **ok).count();
    let failed = results.len() - cached;
    info!(version = %self.policy.version, cached, failed, "Installed static assets");
    (cached, failed)
  }

  /// Drop every partition that doesn't belong to the current version.
  pub fn activate(&self) -> Vec<String> {
    let current = self.policy.cache_names();
    let names = match self.storage.cache_names() {
      Ok(names) => names,
      Err(e) => {
        warn!(error = %e, "Failed to list caches during activation");
        return Vec::new();
      }
    };

    let mut dropped = Vec::new();
    for name in names.into_iter().filter(|n| !current.contains(n)) {
      match self.storage.delete_cache(&name) {
        Ok(entries) => {
          info!(cache = %name, entries, "Deleted outdated cache");
          dropped.push(name);
        }
        Err(e) => warn!(cache = %name, error = %e, "Failed to delete outdated cache"),
      }
    }
    dropped
  }

  /// Drop every partition, current version included.
  pub fn clear(&self) -> usize {
    let names = match self.storage.cache_names() {
      Ok(names) => names,
      Err(e) => {
        warn!(error = %e, "Failed to list caches");
        return 0;
      }
    };

    names
      .iter()
      .filter(|name| match self.storage.delete_cache(name) {
        Ok(_) => true,
        Err(e) => {
          warn!(cache = %name, error = %e, "Failed to delete cache");
          false
        }
      })
      .count()
  }

  /// Fetch and store specific URLs, each into the partition it classifies to.
  ///
  /// Returns `(cached, failed)`. Cross-origin URLs count as failed.
  pub async fn prime(&self, urls: &[Url]) -> (usize, usize) {
    let results = join_all(urls.iter().map(|url| async move {
      if !self.policy.is_same_origin(url) {
        debug!(%url, "Not priming cross-origin URL");
        return false;
      }
      self.fetch_into(self.policy.classify(url), url).await
    }))
    .await;

    let cached = results.iter().filter(|ok| **ok).count();
    (cached, results.len() - cached)
  }

  pub fn partition_len(&self, partition: Partition) -> usize {
    self
      .storage
      .len(&partition.cache_name(&self.policy.version))
      .unwrap_or_else(|e| {
        warn!(%partition, error = %e, "Failed to count cache entries");
        0
      })
  }

  async fn passthrough(&self, request: Request) -> CacheResult {
    match self.fetcher.fetch(&request).await {
      Ok(response) => CacheResult::from_network(response),
      Err(e) => {
        warn!(url = %request.url, error = %e, "Network fetch failed");
        self.offline_response(&request)
      }
    }
  }

  fn lookup(&self, key: &str) -> Option<(Partition, CachedEntry)> {
    Partition::ALL.into_iter().find_map(|partition| {
      let name = partition.cache_name(&self.policy.version);
      match self.storage.get(&name, key) {
        Ok(entry) => entry.map(|e| (partition, e)),
        Err(e) => {
          warn!(cache = %name, error = %e, "Cache read failed, treating as miss");
          None
        }
      }
    })
  }

  /// Refresh the entry in its existing partition once the network answers.
  fn spawn_revalidation(&self, request: Request, partition: Partition) -> JoinHandle<()> {
    let layer = self.clone();
    tokio::spawn(async move {
      match layer.fetcher.fetch(&request).await {
        Ok(response) if response.is_success() => {
          layer.store(partition, &request.url, &response);
          debug!(url = %request.url, "Revalidated cache entry");
        }
        Ok(response) => {
          debug!(url = %request.url, status = response.status, "Revalidation not cacheable");
        }
        Err(e) => {
          debug!(url = %request.url, error = %e, "Revalidation failed, keeping cached entry");
        }
      }
    })
  }

  async fn fetch_into(&self, partition: Partition, url: &Url) -> bool {
    match self.fetcher.fetch(&Request::get(url.clone())).await {
      Ok(response) if response.is_success() => self.store(partition, url, &response),
      Ok(response) => {
        warn!(%url, status = response.status, "Not caching unsuccessful response");
        false
      }
      Err(e) => {
        warn!(%url, error = %e, "Failed to fetch for cache");
        false
      }
    }
  }

  /// Write an entry and evict oldest-inserted entries past the bound.
  fn store(&self, partition: Partition, url: &Url, response: &Response) -> bool {
    let name = partition.cache_name(&self.policy.version);
    let max = self.policy.limits.max(partition);
    match self
      .storage
      .insert_bounded(&name, &cache_key(url), url.as_str(), response, max)
    {
      Ok(0) => true,
      Ok(evicted) => {
        debug!(cache = %name, evicted, "Evicted oldest cache entries");
        true
      }
      Err(e) => {
        warn!(cache = %name, %url, error = %e, "Failed to write cache entry");
        false
      }
    }
  }

  fn offline_response(&self, request: &Request) -> CacheResult {
    if !request.navigate {
      return CacheResult::offline(Response::empty(503), CacheSource::Unavailable);
    }

    let cached_page = self
      .policy
      .offline_page
      .as_deref()
      .and_then(|page| self.policy.origin.join(page).ok())
      .and_then(|url| {
        let name = Partition::Static.cache_name(&self.policy.version);
        self.storage.get(&name, &cache_key(&url)).ok().flatten()
      });

    let response = match cached_page {
      Some(entry) => entry.response,
      None => Response {
        status: 200,
        content_type: Some("text/html; charset=utf-8".to_string()),
        body: OFFLINE_HTML.as_bytes().to_vec(),
      },
    };
    CacheResult::offline(response, CacheSource::OfflineFallback)
  }
}

impl<S: CacheStorage, F: Fetcher> Clone for CacheLayer<S, F> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      policy: Arc::clone(&self.policy),
    }
  }
}
