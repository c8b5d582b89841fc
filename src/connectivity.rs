//! Online/offline tracking.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

/// Shared view of whether the origin is reachable.
pub struct Connectivity {
  tx: watch::Sender<bool>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _) = watch::channel(online);
    Self { tx }
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  /// Record the latest reachability. Returns true only on an offline → online flip.
  pub fn set(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      true
    });

    if changed {
      info!(online, "Connectivity changed");
    }
    changed && online
  }

  /// Probe `url` with a HEAD request every `interval` and feed the result in.
  pub fn spawn_probe(
    self: Arc<Self>,
    client: reqwest::Client,
    url: Url,
    interval: Duration,
  ) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        // Any answer at all means the network is there
        let reachable = client.head(url.clone()).send().await.is_ok();
        debug!(%url, reachable, "Connectivity probe");
        self.set(reachable);
      }
    })
  }
}
