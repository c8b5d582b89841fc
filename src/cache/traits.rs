//! Core types for the response cache.

use chrono::{DateTime, Utc};
use reqwest::Method;
use sha2::{Digest, Sha256};
use std::fmt;
use tokio::task::JoinHandle;
use url::Url;

/// Named bucket a response is filed under on first cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
  Static,
  Dynamic,
  Image,
}

impl Partition {
  pub const ALL: [Partition; 3] = [Partition::Static, Partition::Dynamic, Partition::Image];

  pub fn as_str(&self) -> &'static str {
    match self {
      Partition::Static => "static",
      Partition::Dynamic => "dynamic",
      Partition::Image => "image",
    }
  }

  /// Versioned cache name, e.g. `image-v3`
  pub fn cache_name(&self, version: &str) -> String {
    format!("{}-{}", self.as_str(), version)
  }
}

impl fmt::Display for Partition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  /// Page navigation (accepts HTML) rather than a subresource
  pub navigate: bool,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      navigate: false,
    }
  }

  pub fn navigate(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      navigate: true,
    }
  }
}

/// A response as served to the page and as stored in a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Empty body with the given status
  pub fn empty(status: u16) -> Self {
    Self {
      status,
      content_type: None,
      body: Vec::new(),
    }
  }
}

/// A stored response plus when it was written.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// Result from a cache operation, including the response and where it came from.
#[derive(Debug)]
pub struct CacheResult {
  pub response: Response,
  pub source: CacheSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// Background refresh started by a cache hit
  pub revalidation: Option<JoinHandle<()>>,
}

impl CacheResult {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
      revalidation: None,
    }
  }

  pub fn from_cache(
    response: Response,
    cached_at: DateTime<Utc>,
    revalidation: JoinHandle<()>,
  ) -> Self {
    Self {
      response,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
      revalidation: Some(revalidation),
    }
  }

  pub fn offline(response: Response, source: CacheSource) -> Self {
    Self {
      response,
      source,
      cached_at: None,
      revalidation: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh from the network
  Network,
  /// Served from a partition while a refresh runs in the background
  Cache,
  /// Network down on a navigation; offline page served
  OfflineFallback,
  /// Network down on a subresource; empty 503
  Unavailable,
}

/// Stable, fixed-length storage key for a URL. Fragments are ignored.
pub fn cache_key(url: &Url) -> String {
  let mut normalized = url.clone();
  normalized.set_fragment(None);

  let mut hasher = Sha256::new();
  hasher.update(normalized.as_str().as_bytes());
  hex::encode(hasher.finalize())
}
