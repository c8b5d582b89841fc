use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::store::{Domain, RecordStore, Status, StoreError};

use super::submit::{SubmitError, Submitter, Submitters};
use super::{DomainResult, SyncEvent, SyncOutcome, SyncSummary};

const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_CAPACITY: usize = 64;
/// Slack on top of the submit timeout before an unrenewed lease expires
const LEASE_GRACE: Duration = Duration::from_secs(60);

static NEXT_ORCHESTRATOR: AtomicU64 = AtomicU64::new(0);

/// Runs sync passes over a record store.
///
/// At most one pass runs at a time; a request arriving while a pass is in
/// flight is dropped rather than queued. This holds across processes sharing
/// a store too: a pass also claims the store's sync lease, renewed before
/// every submit.
pub struct SyncOrchestrator<S: RecordStore> {
  store: Arc<S>,
  submitters: Submitters,
  syncing: AtomicBool,
  lease_holder: String,
  submit_timeout: Duration,
  events: broadcast::Sender<SyncEvent>,
}

impl<S: RecordStore> SyncOrchestrator<S> {
  pub fn new(store: Arc<S>, submitters: Submitters) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      store,
      submitters,
      syncing: AtomicBool::new(false),
      lease_holder: format!(
        "{}-{}",
        std::process::id(),
        NEXT_ORCHESTRATOR.fetch_add(1, Ordering::Relaxed)
      ),
      submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
      events,
    }
  }

  /// Bound on a single remote submission.
  pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
    self.submit_timeout = timeout;
    self
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.events.subscribe()
  }

  pub fn is_syncing(&self) -> bool {
    self.syncing.load(Ordering::SeqCst)
  }

  /// Run one pass over every domain.
  pub async fn sync_all(&self) -> SyncOutcome {
    let guard = match self.guard() {
      Ok(Some(guard)) => guard,
      Ok(None) => {
        info!("Sync already in progress, skipping");
        return SyncOutcome::Skipped;
      }
      Err(e) => {
        error!(error = %e, "Could not claim sync lease");
        self.emit(SyncEvent::Failed {
          error: e.to_string(),
        });
        return SyncOutcome::Failed(e.to_string());
      }
    };

    self.emit(SyncEvent::Started);
    let result = self.run_pass().await;
    drop(guard);

    match result {
      Ok(summary) => {
        info!(
          synced = summary.synced(),
          failed = summary.failed(),
          total = summary.total(),
          "Sync pass completed"
        );
        self.emit(SyncEvent::Completed(summary.clone()));
        SyncOutcome::Completed(summary)
      }
      Err(e) => {
        error!(error = %e, "Sync pass aborted");
        self.emit(SyncEvent::Failed {
          error: e.to_string(),
        });
        SyncOutcome::Failed(e.to_string())
      }
    }
  }

  /// Move `failed` records back to `pending` so the next pass picks them up.
  ///
  /// Does nothing while a pass is running.
  pub fn retry_failed(&self, domain: Option<Domain>) -> Result<usize, StoreError> {
    let Some(_guard) = self.guard()? else {
      warn!("Sync in progress, not requeueing failed records");
      return Ok(0);
    };

    let domains = match domain {
      Some(d) => vec![d],
      None => Domain::ALL.to_vec(),
    };

    let mut requeued = 0;
    for domain in domains {
      for record in self.store.get_by_status(domain, Status::Failed)? {
        self
          .store
          .update_status(domain, record.id, Status::Pending, None)?;
        requeued += 1;
      }
    }

    info!(requeued, "Requeued failed records");
    Ok(requeued)
  }

  async fn run_pass(&self) -> Result<SyncSummary, StoreError> {
    let mut summary = SyncSummary::default();

    for domain in Domain::ALL {
      let Some(submitter) = self.submitters.get(domain) else {
        debug!(%domain, "No submitter registered, leaving records pending");
        continue;
      };

      let pending = self.store.get_by_status(domain, Status::Pending)?;
      if pending.is_empty() {
        continue;
      }

      let mut result = DomainResult {
        total: pending.len(),
        ..Default::default()
      };

      for record in pending {
        if !self
          .store
          .acquire_sync_lease(&self.lease_holder, self.lease_ttl())?
        {
          return Err(StoreError::LeaseLost);
        }

        let (status, message) = match self.submit(submitter.as_ref(), &record.payload).await {
          Ok(()) => (Status::Synced, None),
          Err(e) => {
            warn!(%domain, id = record.id, error = %e, "Record failed to sync");
            (Status::Failed, Some(e.to_string()))
          }
        };

        match self
          .store
          .update_status(domain, record.id, status, message.as_deref())
        {
          Ok(_) => {}
          // Deleted underneath us; nothing left to mark
          Err(StoreError::NotFound { .. }) => {
            warn!(%domain, id = record.id, "Record vanished during sync");
            result.total -= 1;
            continue;
          }
          Err(e) => return Err(e),
        }

        match status {
          Status::Synced => result.synced += 1,
          _ => result.failed += 1,
        }
      }

      debug!(%domain, synced = result.synced, failed = result.failed, "Domain drained");
      summary.per_domain.insert(domain, result);
    }

    Ok(summary)
  }

  fn guard(&self) -> Result<Option<SyncGuard<'_, S>>, StoreError> {
    SyncGuard::acquire(
      &self.syncing,
      self.store.as_ref(),
      &self.lease_holder,
      self.lease_ttl(),
    )
  }

  fn lease_ttl(&self) -> Duration {
    self.submit_timeout + LEASE_GRACE
  }

  async fn submit(&self, submitter: &dyn Submitter, payload: &Value) -> Result<(), SubmitError> {
    tokio::time::timeout(self.submit_timeout, submitter.submit(payload))
      .await
      .unwrap_or(Err(SubmitError::Timeout(self.submit_timeout)))
  }

  fn emit(&self, event: SyncEvent) {
    // No listeners is fine
    let _ = self.events.send(event);
  }
}

/// Holds the `syncing` flag and the store's sync lease for the duration of a
/// pass.
struct SyncGuard<'a, S: RecordStore> {
  flag: &'a AtomicBool,
  store: &'a S,
  holder: &'a str,
}

impl<'a, S: RecordStore> SyncGuard<'a, S> {
  /// `None` when this orchestrator or another process is already syncing.
  fn acquire(
    flag: &'a AtomicBool,
    store: &'a S,
    holder: &'a str,
    ttl: Duration,
  ) -> Result<Option<Self>, StoreError> {
    if flag
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      return Ok(None);
    }

    match store.acquire_sync_lease(holder, ttl) {
      Ok(true) => Ok(Some(Self {
        flag,
        store,
        holder,
      })),
      Ok(false) => {
        debug!("Sync lease held elsewhere");
        flag.store(false, Ordering::SeqCst);
        Ok(None)
      }
      Err(e) => {
        flag.store(false, Ordering::SeqCst);
        Err(e)
      }
    }
  }
}

impl<S: RecordStore> Drop for SyncGuard<'_, S> {
  fn drop(&mut self) {
    if let Err(e) = self.store.release_sync_lease(self.holder) {
      warn!(error = %e, "Failed to release sync lease");
    }
    self.flag.store(false, Ordering::SeqCst);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{Record, RecordId, SqliteStore};
  use async_trait::async_trait;
  use chrono::{DateTime, Utc};
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;

  /// Fails any payload carrying `"fail": true`.
  #[derive(Default)]
  struct FakeSubmitter {
    calls: AtomicUsize,
    delay: Duration,
  }

  impl FakeSubmitter {
    fn slow(delay: Duration) -> Self {
      Self {
        delay,
        ..Default::default()
      }
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl Submitter for FakeSubmitter {
    async fn submit(&self, payload: &Value) -> Result<(), SubmitError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if !self.delay.is_zero() {
        tokio::time::sleep(self.delay).await;
      }
      if payload["fail"] == json!(true) {
        Err(SubmitError::Rejected { status: 422 })
      } else {
        Ok(())
      }
    }
  }

  fn setup(submitter: Arc<FakeSubmitter>) -> (Arc<SqliteStore>, SyncOrchestrator<SqliteStore>) {
    let store = Arc::new(SqliteStore::open_in_memory("tester").unwrap());
    let submitters = Domain::ALL
      .iter()
      .fold(Submitters::new(), |s, d| s.with(*d, submitter.clone()));
    let orchestrator = SyncOrchestrator::new(store.clone(), submitters);
    (store, orchestrator)
  }

  fn completed(outcome: SyncOutcome) -> SyncSummary {
    match outcome {
      SyncOutcome::Completed(summary) => summary,
      other => panic!("expected completed pass, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_offline_receipts_sync_when_back_online() {
    let submitter = Arc::new(FakeSubmitter::default());
    let (store, orchestrator) = setup(submitter.clone());
    for po in 0..3 {
      store.add(Domain::Receipt, json!({ "po": po })).unwrap();
    }

    let summary = completed(orchestrator.sync_all().await);

    assert_eq!(summary.synced(), 3);
    assert_eq!(summary.failed(), 0);
    assert_eq!(
      summary.per_domain[&Domain::Receipt],
      DomainResult {
        synced: 3,
        failed: 0,
        total: 3
      }
    );
    assert_eq!(store.count(Domain::Receipt, Some(Status::Synced)).unwrap(), 3);
    assert!(!orchestrator.is_syncing());
  }

  #[tokio::test]
  async fn test_failed_record_does_not_block_others() {
    let submitter = Arc::new(FakeSubmitter::default());
    let (store, orchestrator) = setup(submitter.clone());
    let a = store.add(Domain::Receipt, json!({ "fail": true })).unwrap();
    let b = store.add(Domain::Receipt, json!({ "po": 2 })).unwrap();
    let later = store.add(Domain::Shipment, json!({ "carrier": "ups" })).unwrap();

    let summary = completed(orchestrator.sync_all().await);

    let a = store.get(Domain::Receipt, a.id).unwrap().unwrap();
    assert_eq!(a.status, Status::Failed);
    assert!(a.error.as_deref().is_some_and(|e| !e.is_empty()));
    let b = store.get(Domain::Receipt, b.id).unwrap().unwrap();
    assert_eq!(b.status, Status::Synced);
    let later = store.get(Domain::Shipment, later.id).unwrap().unwrap();
    assert_eq!(later.status, Status::Synced);

    assert_eq!(summary.synced(), 2);
    assert_eq!(summary.failed(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_starts_run_one_pass() {
    let submitter = Arc::new(FakeSubmitter::slow(Duration::from_millis(20)));
    let (store, orchestrator) = setup(submitter.clone());
    store.add(Domain::Scan, json!({ "sku": "X" })).unwrap();
    store.add(Domain::Scan, json!({ "sku": "Y" })).unwrap();

    let outcomes =
      futures::future::join_all((0..8).map(|_| orchestrator.sync_all())).await;

    let ran = outcomes
      .iter()
      .filter(|o| matches!(o, SyncOutcome::Completed(_)))
      .count();
    let skipped = outcomes
      .iter()
      .filter(|o| matches!(o, SyncOutcome::Skipped))
      .count();
    assert_eq!(ran, 1);
    assert_eq!(skipped, 7);
    assert_eq!(submitter.calls(), 2);
  }

  #[tokio::test]
  async fn test_back_to_back_triggers_only_transition_once() {
    let submitter = Arc::new(FakeSubmitter::slow(Duration::from_millis(10)));
    let (store, orchestrator) = setup(submitter.clone());
    store.add(Domain::Pick, json!({})).unwrap();
    let mut events = orchestrator.subscribe();

    let (first, second) = tokio::join!(orchestrator.sync_all(), orchestrator.sync_all());

    assert!(matches!(first, SyncOutcome::Completed(_)));
    assert_eq!(second, SyncOutcome::Skipped);
    assert_eq!(events.recv().await.unwrap(), SyncEvent::Started);
    assert!(matches!(
      events.recv().await.unwrap(),
      SyncEvent::Completed(_)
    ));
    assert!(events.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_hung_submit_times_out() {
    let submitter = Arc::new(FakeSubmitter::slow(Duration::from_secs(5)));
    let (store, orchestrator) = setup(submitter);
    let orchestrator = orchestrator.with_submit_timeout(Duration::from_millis(30));
    let record = store.add(Domain::Count, json!({ "bin": "C9" })).unwrap();

    let summary = completed(orchestrator.sync_all().await);

    assert_eq!(summary.failed(), 1);
    let record = store.get(Domain::Count, record.id).unwrap().unwrap();
    assert_eq!(record.status, Status::Failed);
    assert!(record.error.unwrap().contains("Timed out"));
  }

  #[tokio::test]
  async fn test_failed_records_wait_for_manual_retry() {
    let submitter = Arc::new(FakeSubmitter::default());
    let (store, orchestrator) = setup(submitter.clone());
    let record = store.add(Domain::Receipt, json!({ "fail": true })).unwrap();

    completed(orchestrator.sync_all().await);
    let second = completed(orchestrator.sync_all().await);
    assert_eq!(second.total(), 0);
    assert_eq!(submitter.calls(), 1);

    assert_eq!(orchestrator.retry_failed(Some(Domain::Receipt)).unwrap(), 1);
    let requeued = store.get(Domain::Receipt, record.id).unwrap().unwrap();
    assert_eq!(requeued.status, Status::Pending);
    assert_eq!(requeued.error, None);

    completed(orchestrator.sync_all().await);
    assert_eq!(submitter.calls(), 2);
  }

  #[tokio::test]
  async fn test_domain_without_submitter_stays_pending() {
    let store = Arc::new(SqliteStore::open_in_memory("tester").unwrap());
    let submitters =
      Submitters::new().with(Domain::Scan, Arc::new(FakeSubmitter::default()));
    let orchestrator = SyncOrchestrator::new(store.clone(), submitters);
    store.add(Domain::Scan, json!({})).unwrap();
    store.add(Domain::Shipment, json!({})).unwrap();

    let summary = completed(orchestrator.sync_all().await);

    assert_eq!(summary.synced(), 1);
    assert!(!summary.per_domain.contains_key(&Domain::Shipment));
    assert_eq!(store.count(Domain::Shipment, Some(Status::Pending)).unwrap(), 1);
  }

  #[tokio::test]
  async fn test_orchestrators_sharing_a_store_file_run_one_pass() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records.db");
    let submitter = Arc::new(FakeSubmitter::slow(Duration::from_millis(20)));
    let orchestrator_on = |store: Arc<SqliteStore>| {
      SyncOrchestrator::new(
        store,
        Submitters::new().with(Domain::Receipt, submitter.clone()),
      )
    };

    let daemon_store = Arc::new(SqliteStore::open(&path, "dock").unwrap());
    let daemon = orchestrator_on(daemon_store.clone());
    let cli = orchestrator_on(Arc::new(SqliteStore::open(&path, "dock").unwrap()));
    let record = daemon_store.add(Domain::Receipt, json!({ "po": 1 })).unwrap();

    let (first, second) = tokio::join!(daemon.sync_all(), cli.sync_all());

    assert_eq!(completed(first).synced(), 1);
    assert_eq!(second, SyncOutcome::Skipped);
    assert_eq!(submitter.calls(), 1);
    assert_eq!(
      daemon_store.get(Domain::Receipt, record.id).unwrap().unwrap().status,
      Status::Synced
    );

    // Released once the pass is over
    assert!(matches!(cli.sync_all().await, SyncOutcome::Completed(_)));
  }

  #[tokio::test]
  async fn test_retry_refused_while_another_process_syncs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records.db");
    let store = Arc::new(SqliteStore::open(&path, "dock").unwrap());
    let record = store.add(Domain::Receipt, json!({})).unwrap();
    store
      .update_status(Domain::Receipt, record.id, Status::Failed, Some("502"))
      .unwrap();

    let other = SqliteStore::open(&path, "dock").unwrap();
    assert!(other
      .acquire_sync_lease("elsewhere", Duration::from_secs(60))
      .unwrap());

    let orchestrator = SyncOrchestrator::new(store.clone(), Submitters::new());
    assert_eq!(orchestrator.retry_failed(None).unwrap(), 0);
    assert_eq!(orchestrator.sync_all().await, SyncOutcome::Skipped);

    other.release_sync_lease("elsewhere").unwrap();
    assert_eq!(orchestrator.retry_failed(None).unwrap(), 1);
  }

  /// Deletes every receipt whenever it is asked to submit.
  struct DeletingSubmitter {
    store: Arc<SqliteStore>,
  }

  #[async_trait]
  impl Submitter for DeletingSubmitter {
    async fn submit(&self, _payload: &Value) -> Result<(), SubmitError> {
      self.store.clear(Domain::Receipt).unwrap();
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_vanished_records_are_not_counted() {
    let store = Arc::new(SqliteStore::open_in_memory("tester").unwrap());
    let submitters = Submitters::new().with(
      Domain::Receipt,
      Arc::new(DeletingSubmitter {
        store: store.clone(),
      }),
    );
    let orchestrator = SyncOrchestrator::new(store.clone(), submitters);
    store.add(Domain::Receipt, json!({ "po": 1 })).unwrap();
    store.add(Domain::Receipt, json!({ "po": 2 })).unwrap();

    let summary = completed(orchestrator.sync_all().await);

    let receipts = summary.per_domain[&Domain::Receipt];
    assert_eq!(receipts.total, receipts.synced + receipts.failed);
    assert_eq!(receipts, DomainResult::default());
  }

  /// Store whose engine is gone.
  struct BrokenStore;

  impl RecordStore for BrokenStore {
    fn add(&self, _domain: Domain, _payload: Value) -> crate::store::Result<Record> {
      Err(StoreError::Storage("engine not initialized".into()))
    }
    fn get(&self, _domain: Domain, _id: RecordId) -> crate::store::Result<Option<Record>> {
      Ok(None)
    }
    fn get_all(&self, _domain: Domain) -> crate::store::Result<Vec<Record>> {
      Ok(Vec::new())
    }
    fn get_by_status(&self, _domain: Domain, _status: Status) -> crate::store::Result<Vec<Record>> {
      Err(StoreError::Storage("engine not initialized".into()))
    }
    fn update_status(
      &self,
      domain: Domain,
      id: RecordId,
      _status: Status,
      _error: Option<&str>,
    ) -> crate::store::Result<Record> {
      Err(StoreError::NotFound { domain, id })
    }
    fn delete(&self, _domain: Domain, _id: RecordId) -> crate::store::Result<bool> {
      Ok(false)
    }
    fn clear(&self, _domain: Domain) -> crate::store::Result<usize> {
      Ok(0)
    }
    fn count(&self, _domain: Domain, _status: Option<Status>) -> crate::store::Result<usize> {
      Ok(0)
    }
    fn purge_synced_before(
      &self,
      _domain: Domain,
      _cutoff: DateTime<Utc>,
    ) -> crate::store::Result<usize> {
      Ok(0)
    }
    fn acquire_sync_lease(&self, _holder: &str, _ttl: Duration) -> crate::store::Result<bool> {
      Ok(true)
    }
    fn release_sync_lease(&self, _holder: &str) -> crate::store::Result<()> {
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_store_failure_emits_sync_failed() {
    let submitters =
      Submitters::new().with(Domain::Scan, Arc::new(FakeSubmitter::default()));
    let orchestrator = SyncOrchestrator::new(Arc::new(BrokenStore), submitters);
    let mut events = orchestrator.subscribe();

    let outcome = orchestrator.sync_all().await;

    assert!(matches!(outcome, SyncOutcome::Failed(ref e) if e.contains("engine not initialized")));
    assert_eq!(events.recv().await.unwrap(), SyncEvent::Started);
    assert!(matches!(
      events.recv().await.unwrap(),
      SyncEvent::Failed { .. }
    ));
    assert!(!orchestrator.is_syncing());
  }
}
