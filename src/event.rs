use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;

use crate::cache::ClientMessage;

/// Reasons to start a sync pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
  /// Connectivity came back
  Online,
  /// Periodic timer; only acted on while online and idle
  Tick,
  /// Explicit request from a user
  Manual,
  /// Relayed from the cache worker
  WorkerMessage,
}

/// Merges every trigger source into one stream
pub struct TriggerHandler {
  tx: mpsc::UnboundedSender<Trigger>,
  rx: mpsc::UnboundedReceiver<Trigger>,
}

impl TriggerHandler {
  /// Create a trigger handler ticking every `tick_rate` and watching `online`
  pub fn new(tick_rate: Duration, mut online: watch::Receiver<bool>) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Periodic timer
    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      // The first tick completes immediately
      interval.tick().await;
      loop {
        interval.tick().await;
        if tick_tx.send(Trigger::Tick).is_err() {
          break;
        }
      }
    });

    // Offline → online transitions
    let online_tx = tx.clone();
    let mut was_online = *online.borrow_and_update();
    tokio::spawn(async move {
      while online.changed().await.is_ok() {
        let now_online = *online.borrow_and_update();
        if now_online && !was_online && online_tx.send(Trigger::Online).is_err() {
          break;
        }
        was_online = now_online;
      }
    });

    Self { tx, rx }
  }

  /// Sender for manual triggers
  pub fn sender(&self) -> mpsc::UnboundedSender<Trigger> {
    self.tx.clone()
  }

  /// Receive the next trigger
  pub async fn next(&mut self) -> Option<Trigger> {
    self.rx.recv().await
  }
}

/// Page-side bridge: turn worker sync requests into triggers.
pub async fn forward_worker_messages(
  mut messages: broadcast::Receiver<ClientMessage>,
  triggers: mpsc::UnboundedSender<Trigger>,
) {
  loop {
    match messages.recv().await {
      Ok(ClientMessage::SyncOfflineData) => {
        if triggers.send(Trigger::WorkerMessage).is_err() {
          break;
        }
      }
      Ok(other) => debug!(?other, "Worker message"),
      Err(broadcast::error::RecvError::Lagged(skipped)) => {
        debug!(skipped, "Missed worker messages");
      }
      Err(broadcast::error::RecvError::Closed) => break,
    }
  }
}
