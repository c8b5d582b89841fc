use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::event::{Trigger, TriggerHandler};
use crate::store::RecordStore;

use super::SyncOrchestrator;

/// Start a pass for every trigger until the trigger stream ends.
///
/// Passes run on their own task, so a trigger landing mid-pass reaches
/// `sync_all` right away and is skipped there instead of piling up.
pub async fn run_sync_agent<S>(
  orchestrator: Arc<SyncOrchestrator<S>>,
  mut triggers: TriggerHandler,
  online: watch::Receiver<bool>,
) where
  S: RecordStore + 'static,
{
  while let Some(trigger) = triggers.next().await {
    if trigger == Trigger::Tick && (!*online.borrow() || orchestrator.is_syncing()) {
      debug!("Skipping periodic sync");
      continue;
    }

    debug!(?trigger, "Sync triggered");
    let orchestrator = orchestrator.clone();
    tokio::spawn(async move {
      orchestrator.sync_all().await;
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{Domain, SqliteStore, Status};
  use crate::sync::submit::{SubmitError, Submitter};
  use crate::sync::{Submitters, SyncEvent};
  use async_trait::async_trait;
  use serde_json::{json, Value};
  use std::time::Duration;

  struct AcceptAll;

  #[async_trait]
  impl Submitter for AcceptAll {
    async fn submit(&self, _payload: &Value) -> Result<(), SubmitError> {
      Ok(())
    }
  }

  fn orchestrator() -> (Arc<SqliteStore>, Arc<SyncOrchestrator<SqliteStore>>) {
    let store = Arc::new(SqliteStore::open_in_memory("agent").unwrap());
    let submitters = Submitters::new().with(Domain::Receipt, Arc::new(AcceptAll));
    let orchestrator = Arc::new(SyncOrchestrator::new(store.clone(), submitters));
    (store, orchestrator)
  }

  #[tokio::test]
  async fn test_coming_online_drains_queue() {
    let (store, orchestrator) = orchestrator();
    for po in 0..3 {
      store.add(Domain::Receipt, json!({ "po": po })).unwrap();
    }
    let mut events = orchestrator.subscribe();

    let (online_tx, online) = watch::channel(false);
    let triggers = TriggerHandler::new(Duration::from_secs(3600), online.clone());
    tokio::spawn(run_sync_agent(orchestrator.clone(), triggers, online));

    online_tx.send(true).unwrap();

    assert_eq!(events.recv().await.unwrap(), SyncEvent::Started);
    match events.recv().await.unwrap() {
      SyncEvent::Completed(summary) => {
        assert_eq!(summary.synced(), 3);
        assert_eq!(summary.failed(), 0);
      }
      other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(store.count(Domain::Receipt, Some(Status::Synced)).unwrap(), 3);
  }

  #[tokio::test]
  async fn test_ticks_ignored_while_offline() {
    let (store, orchestrator) = orchestrator();
    store.add(Domain::Receipt, json!({})).unwrap();

    let (_online_tx, online) = watch::channel(false);
    let triggers = TriggerHandler::new(Duration::from_millis(10), online.clone());
    tokio::spawn(run_sync_agent(orchestrator, triggers, online));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(store.count(Domain::Receipt, Some(Status::Pending)).unwrap(), 1);
  }
}
