//! Background sync worker: drives convergence between the local record
//! store and the cloud store under unreliable connectivity.
//!
//! One worker task per engine. Cycle triggers: the fixed-interval timer,
//! a connectivity-restored edge on the watch channel, and explicit
//! `force_sync_now` commands. At most one cycle is ever in flight; force
//! requests that arrive mid-cycle attach to the running cycle and resolve
//! with its outcome instead of starting another.
//!
//! Within a cycle, workspaces are reconciled to completion before any
//! document is pushed (documents depend on workspace ids), and records
//! are pushed with bounded concurrency so the remote store is never
//! saturated. Losing connectivity aborts the cycle: in-flight remote
//! calls are cancelled cooperatively, per-record updates already applied
//! are kept, and unfinished records stay pending for the next cycle.

use crate::cloud::{CloudError, CloudStore, RemoteRecord};
use crate::record::{Record, RecordKind, now_ms};
use crate::status::SyncStatusManager;
use crate::store::{RecordStore, StoreError};
use futures::stream::{self, StreamExt};
use rand::Rng;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration for cycle scheduling and retry behavior.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Fixed interval between timer-triggered cycles
    pub sync_interval: Duration,
    /// Timeout applied to every remote call
    pub call_timeout: Duration,
    /// Maximum simultaneously in-flight remote upserts
    pub max_concurrent: usize,
    /// Retries per record after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Cap for the backoff delay
    pub max_backoff: Duration,
    /// Multiplier applied per retry
    pub backoff_factor: f64,
    /// Random jitter added to each delay, as a fraction of it (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
            max_concurrent: 4,
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            backoff_factor: 2.0,
            jitter: 0.2,
        }
    }
}

/// Calculates the delay before retry `attempt` (1-based): exponential,
/// capped at `max_backoff`, with up to `jitter` of the delay added on top.
pub fn calculate_backoff(attempt: u32, config: &SyncConfig) -> Duration {
    let base = config.initial_backoff.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);
    let capped = base.min(config.max_backoff.as_secs_f64());
    let jittered = if config.jitter > 0.0 {
        capped * (1.0 + rand::rng().random_range(0.0..config.jitter))
    } else {
        capped
    };
    Duration::from_secs_f64(jittered)
}

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every pending record was pushed.
    Succeeded { synced: usize },
    /// Some records failed permanently or exhausted their retries;
    /// the rest were pushed.
    PartiallyFailed { synced: usize, failed: usize },
    /// Connectivity was lost mid-cycle. Unfinished records stay pending.
    Aborted { synced: usize, remaining: usize },
}

impl CycleOutcome {
    /// Records pushed successfully during the cycle.
    pub fn synced(&self) -> usize {
        match self {
            CycleOutcome::Succeeded { synced }
            | CycleOutcome::PartiallyFailed { synced, .. }
            | CycleOutcome::Aborted { synced, .. } => *synced,
        }
    }

    pub fn failed(&self) -> usize {
        match self {
            CycleOutcome::PartiallyFailed { failed, .. } => *failed,
            _ => 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("sync worker is not running")]
    NotRunning,
}

/// Why pushing a single record failed.
#[derive(Debug, Error)]
enum PushError {
    #[error("remote upsert failed for {kind} {id}: {source}")]
    Upsert {
        kind: &'static str,
        id: String,
        source: CloudError,
    },

    #[error("failed to persist sync metadata for {kind} {id}: {source}")]
    Store {
        kind: &'static str,
        id: String,
        source: StoreError,
    },
}

pub(crate) enum WorkerCommand {
    ForceSync(oneshot::Sender<CycleOutcome>),
    Shutdown,
}

/// Handle to the spawned worker task.
pub struct SyncWorkerHandle {
    cmd_tx: mpsc::UnboundedSender<WorkerCommand>,
    task: JoinHandle<()>,
}

impl SyncWorkerHandle {
    /// Request a cycle and return the receiver for its outcome without
    /// awaiting. If a cycle is already running the request attaches to it.
    pub(crate) fn request_sync(&self) -> Result<oneshot::Receiver<CycleOutcome>, WorkerError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(WorkerCommand::ForceSync(tx))
            .map_err(|_| WorkerError::NotRunning)?;
        Ok(rx)
    }

    /// Trigger a cycle (or attach to the in-flight one) and wait for its
    /// outcome.
    pub async fn force_sync_now(&self) -> Result<CycleOutcome, WorkerError> {
        self.request_sync()?
            .await
            .map_err(|_| WorkerError::NotRunning)
    }

    /// Stop the worker, letting an in-flight cycle finish first.
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(WorkerCommand::Shutdown);
        let _ = self.task.await;
    }
}

/// Per-cycle progress counters, shared with the cycle future so an abort
/// can report how far it got.
#[derive(Default)]
struct CycleProgress {
    total: AtomicUsize,
    synced: AtomicUsize,
    failed: AtomicUsize,
}

/// The background sync worker. Construct with [`SyncWorker::new`] and
/// start it with [`SyncWorker::spawn`].
pub struct SyncWorker {
    store: Arc<dyn RecordStore>,
    cloud: Arc<dyn CloudStore>,
    status: Arc<SyncStatusManager>,
    config: SyncConfig,
    online_rx: watch::Receiver<bool>,
    guard: Arc<Mutex<()>>,
}

impl SyncWorker {
    pub fn new(
        store: Arc<dyn RecordStore>,
        cloud: Arc<dyn CloudStore>,
        status: Arc<SyncStatusManager>,
        config: SyncConfig,
        online_rx: watch::Receiver<bool>,
        guard: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            store,
            cloud,
            status,
            config,
            online_rx,
            guard,
        }
    }

    /// Spawn the worker task and return its handle.
    pub fn spawn(self) -> SyncWorkerHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(cmd_rx));
        SyncWorkerHandle { cmd_tx, task }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<WorkerCommand>) {
        let mut interval = tokio::time::interval(self.config.sync_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval completes immediately;
        // consume it so starting the worker does not imply a cycle.
        interval.tick().await;

        info!(
            "Sync worker started (interval {:?})",
            self.config.sync_interval
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if *self.online_rx.borrow() {
                        debug!("Interval tick: starting sync cycle");
                        if self.run_cycle(&mut cmd_rx, Vec::new()).await {
                            break;
                        }
                    } else {
                        debug!("Interval tick skipped: offline");
                    }
                }
                changed = self.online_rx.changed() => {
                    if changed.is_err() {
                        // Engine dropped the connectivity sender.
                        break;
                    }
                    if *self.online_rx.borrow() {
                        info!("Connectivity restored: starting catch-up cycle");
                        if self.run_cycle(&mut cmd_rx, Vec::new()).await {
                            break;
                        }
                    }
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(WorkerCommand::ForceSync(tx)) => {
                        debug!("Explicit sync requested");
                        if self.run_cycle(&mut cmd_rx, vec![tx]).await {
                            break;
                        }
                    }
                    Some(WorkerCommand::Shutdown) | None => break,
                }
            }
        }

        info!("Sync worker stopped");
    }

    /// Run one cycle while continuing to service the command channel.
    ///
    /// `ForceSync` requests received while the cycle runs attach to it; a
    /// connectivity drop aborts it. Returns true if a shutdown request
    /// arrived (the cycle still runs to its natural end first).
    async fn run_cycle(
        &mut self,
        cmd_rx: &mut mpsc::UnboundedReceiver<WorkerCommand>,
        mut waiters: Vec<oneshot::Sender<CycleOutcome>>,
    ) -> bool {
        // Only an explicit trigger can reach this point while offline;
        // it aborts with zero work, like losing connectivity at record
        // zero would.
        if !*self.online_rx.borrow() {
            debug!("Sync requested while offline; aborting immediately");
            for tx in waiters {
                let _ = tx.send(CycleOutcome::Aborted {
                    synced: 0,
                    remaining: 0,
                });
            }
            return false;
        }

        self.status.report_cycle_start();
        let progress = Arc::new(CycleProgress::default());
        let mut shutdown = false;
        let mut cmd_rx_open = true;
        let mut watch_alive = true;

        let outcome = {
            let mut cycle = pin!(Self::execute_cycle(
                Arc::clone(&self.store),
                Arc::clone(&self.cloud),
                Arc::clone(&self.status),
                self.config.clone(),
                Arc::clone(&self.guard),
                Arc::clone(&progress),
            ));

            loop {
                tokio::select! {
                    outcome = &mut cycle => break outcome,
                    changed = self.online_rx.changed(), if watch_alive => {
                        match changed {
                            Ok(()) if !*self.online_rx.borrow() => {
                                // Dropping the cycle future cancels in-flight
                                // remote calls; completed record updates and
                                // the progress counters are kept.
                                let synced = progress.synced.load(Ordering::SeqCst);
                                let done = synced + progress.failed.load(Ordering::SeqCst);
                                let remaining =
                                    progress.total.load(Ordering::SeqCst).saturating_sub(done);
                                warn!(
                                    "Connectivity lost mid-cycle after {} record(s); aborting",
                                    synced
                                );
                                break CycleOutcome::Aborted { synced, remaining };
                            }
                            Ok(()) => {}
                            Err(_) => {
                                watch_alive = false;
                                shutdown = true;
                            }
                        }
                    }
                    cmd = cmd_rx.recv(), if cmd_rx_open => match cmd {
                        Some(WorkerCommand::ForceSync(tx)) => {
                            debug!("Sync requested mid-cycle; attaching to running cycle");
                            waiters.push(tx);
                        }
                        Some(WorkerCommand::Shutdown) => shutdown = true,
                        None => {
                            cmd_rx_open = false;
                            shutdown = true;
                        }
                    }
                }
            }
        };

        let total = progress.total.load(Ordering::SeqCst);
        self.status
            .set_pending_uploads(total.saturating_sub(outcome.synced()));
        self.status.report_cycle_end(&outcome);
        info!("Sync cycle finished: {:?}", outcome);

        for tx in waiters {
            let _ = tx.send(outcome.clone());
        }
        shutdown
    }

    /// The cycle body: enumerate pending records and push them.
    ///
    /// Workspaces are reconciled to completion before documents, because
    /// documents depend on workspace ids being present remotely. Holds
    /// the engine guard for the duration so migration never runs against
    /// the same records concurrently.
    async fn execute_cycle(
        store: Arc<dyn RecordStore>,
        cloud: Arc<dyn CloudStore>,
        status: Arc<SyncStatusManager>,
        config: SyncConfig,
        guard: Arc<Mutex<()>>,
        progress: Arc<CycleProgress>,
    ) -> CycleOutcome {
        let _guard = guard.lock().await;

        let mut phases = Vec::new();
        for kind in [RecordKind::Workspace, RecordKind::Document] {
            match store.read_all(kind).await {
                Ok(records) => {
                    let pending: Vec<Record> = records
                        .into_iter()
                        .filter(|r| r.meta().is_pending())
                        .collect();
                    phases.push(pending);
                }
                Err(e) => {
                    error!("Failed to read local {} records: {}", kind.as_str(), e);
                    status.record_failed_operation(format!(
                        "local store read failed for {}s: {}",
                        kind.as_str(),
                        e
                    ));
                    progress.failed.fetch_add(1, Ordering::SeqCst);
                    return CycleOutcome::PartiallyFailed {
                        synced: 0,
                        failed: 1,
                    };
                }
            }
        }

        let total: usize = phases.iter().map(|p| p.len()).sum();
        progress.total.store(total, Ordering::SeqCst);
        status.set_pending_uploads(total);

        if total == 0 {
            debug!("Nothing to sync");
            return CycleOutcome::Succeeded { synced: 0 };
        }
        info!(
            "Sync cycle: {} workspace(s), {} document(s) pending",
            phases[0].len(),
            phases[1].len()
        );

        for batch in phases {
            stream::iter(batch)
                .for_each_concurrent(config.max_concurrent, |record| {
                    let store = Arc::clone(&store);
                    let cloud = Arc::clone(&cloud);
                    let status = Arc::clone(&status);
                    let progress = Arc::clone(&progress);
                    let config = config.clone();
                    async move {
                        let id = record.local_id().to_string();
                        let kind = record.kind();
                        match Self::push_record(store.as_ref(), cloud.as_ref(), &config, record)
                            .await
                        {
                            Ok(()) => {
                                progress.synced.fetch_add(1, Ordering::SeqCst);
                                debug!("Synced {} {}", kind.as_str(), id);
                            }
                            Err(e) => {
                                progress.failed.fetch_add(1, Ordering::SeqCst);
                                warn!("Giving up on {} {} this cycle: {}", kind.as_str(), id, e);
                                status.record_failed_operation(e.to_string());
                            }
                        }
                    }
                })
                .await;
        }

        let synced = progress.synced.load(Ordering::SeqCst);
        let failed = progress.failed.load(Ordering::SeqCst);
        if failed == 0 {
            CycleOutcome::Succeeded { synced }
        } else {
            CycleOutcome::PartiallyFailed { synced, failed }
        }
    }

    /// Push a single record, retrying transient failures with backoff.
    ///
    /// On success the record's sync metadata is updated and written back
    /// to the local store.
    async fn push_record(
        store: &dyn RecordStore,
        cloud: &dyn CloudStore,
        config: &SyncConfig,
        mut record: Record,
    ) -> Result<(), PushError> {
        let kind = record.kind().as_str();
        let remote = remote_payload(&record);

        let mut attempt: u32 = 0;
        let remote_id = loop {
            attempt += 1;
            let result =
                match tokio::time::timeout(config.call_timeout, cloud.upsert(remote.clone())).await
                {
                    Ok(result) => result,
                    Err(_) => Err(CloudError::Timeout(format!(
                        "no response within {:?}",
                        config.call_timeout
                    ))),
                };

            match result {
                Ok(id) => break id,
                Err(e) if e.is_transient() && attempt <= config.max_retries => {
                    let delay = calculate_backoff(attempt, config);
                    debug!(
                        "Transient failure for {} {} (attempt {}): {}; retrying in {:?}",
                        kind,
                        record.local_id(),
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(PushError::Upsert {
                        kind,
                        id: record.local_id().to_string(),
                        source: e,
                    });
                }
            }
        };

        let id = record.local_id().to_string();
        record.meta_mut().mark_synced(remote_id, now_ms());
        store
            .put(record)
            .await
            .map_err(|e| PushError::Store { kind, id, source: e })
    }
}

/// Build the remote representation of a record for upsert.
fn remote_payload(record: &Record) -> RemoteRecord {
    match record {
        Record::Workspace(ws) => RemoteRecord {
            id: ws.meta.cloud_id.clone(),
            kind: RecordKind::Workspace,
            owner_id: ws.meta.owner_id.clone(),
            name: ws.name.clone(),
            workspace_id: None,
            payload: serde_json::json!({
                "localId": ws.meta.local_id,
                "syncVersion": ws.meta.sync_version,
            }),
        },
        Record::Document(doc) => RemoteRecord {
            id: doc.meta.cloud_id.clone(),
            kind: RecordKind::Document,
            owner_id: doc.meta.owner_id.clone(),
            name: doc.title.clone(),
            workspace_id: Some(doc.workspace_id.clone()),
            payload: serde_json::json!({
                "localId": doc.meta.local_id,
                "content": doc.content,
                "syncVersion": doc.meta.sync_version,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::InMemoryCloud;
    use crate::record::{Document, Workspace};
    use crate::store::InMemoryStore;

    fn no_jitter_config() -> SyncConfig {
        SyncConfig {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            backoff_factor: 2.0,
            jitter: 0.0,
            ..Default::default()
        }
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            sync_interval: Duration::from_secs(3600),
            call_timeout: Duration::from_millis(200),
            max_concurrent: 2,
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            backoff_factor: 2.0,
            jitter: 0.0,
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        cloud: Arc<InMemoryCloud>,
        status: Arc<SyncStatusManager>,
        online_tx: watch::Sender<bool>,
        handle: SyncWorkerHandle,
    }

    fn spawn_worker(config: SyncConfig) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let cloud = Arc::new(InMemoryCloud::new());
        let status = Arc::new(SyncStatusManager::new());
        let (online_tx, online_rx) = watch::channel(true);
        let worker = SyncWorker::new(
            Arc::clone(&store) as Arc<dyn RecordStore>,
            Arc::clone(&cloud) as Arc<dyn CloudStore>,
            Arc::clone(&status),
            config,
            online_rx,
            Arc::new(Mutex::new(())),
        );
        Fixture {
            store,
            cloud,
            status,
            online_tx,
            handle: worker.spawn(),
        }
    }

    // ==================== Backoff calculation ====================

    #[test]
    fn test_calculate_backoff_first_attempt() {
        let config = no_jitter_config();
        assert_eq!(calculate_backoff(1, &config), Duration::from_millis(500));
    }

    #[test]
    fn test_calculate_backoff_doubles_and_caps() {
        let config = no_jitter_config();

        // 500ms, 1s, 2s, 4s, 8s (capped)
        assert_eq!(calculate_backoff(1, &config), Duration::from_millis(500));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(1));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(2));
        assert_eq!(calculate_backoff(4, &config), Duration::from_secs(4));
        assert_eq!(calculate_backoff(5, &config), Duration::from_secs(8));
        assert_eq!(calculate_backoff(10, &config), Duration::from_secs(8));
    }

    #[test]
    fn test_calculate_backoff_jitter_bounds() {
        let config = SyncConfig {
            jitter: 0.5,
            ..no_jitter_config()
        };

        for _ in 0..50 {
            let delay = calculate_backoff(2, &config);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay < Duration::from_millis(1500));
        }
    }

    // ==================== Cycle behavior ====================

    #[tokio::test]
    async fn test_cycle_pushes_pending_records() {
        let fx = spawn_worker(fast_config());

        let ws = Workspace::new("Team", 1000);
        let ws_id = ws.meta.local_id.clone();
        fx.store.put(Record::Workspace(ws)).await.unwrap();
        let doc = Document::new("Notes", ws_id.clone(), 1000);
        let doc_id = doc.meta.local_id.clone();
        fx.store.put(Record::Document(doc)).await.unwrap();

        let outcome = fx.handle.force_sync_now().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Succeeded { synced: 2 });

        let ws = fx
            .store
            .get(RecordKind::Workspace, &ws_id)
            .await
            .unwrap()
            .unwrap();
        assert!(ws.meta().cloud_synced);
        assert_eq!(ws.meta().sync_version, 1);
        assert!(ws.meta().cloud_id.is_some());

        let doc = fx
            .store
            .get(RecordKind::Document, &doc_id)
            .await
            .unwrap()
            .unwrap();
        assert!(doc.meta().cloud_synced);
        assert_eq!(fx.cloud.len(), 2);

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_cycle_skips_already_synced_records() {
        let fx = spawn_worker(fast_config());

        let mut ws = Workspace::new("Team", 1000);
        ws.meta.mark_synced("cloud-ws".into(), 2000);
        fx.store.put(Record::Workspace(ws)).await.unwrap();

        let outcome = fx.handle.force_sync_now().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Succeeded { synced: 0 });
        assert_eq!(fx.cloud.upsert_attempts(), 0);

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_cycle_reuses_cloud_id_on_changed_records() {
        let fx = spawn_worker(fast_config());

        let mut ws = Workspace::new("Team", 1000);
        ws.meta.mark_synced("cloud-ws".into(), 2000);
        ws.meta.touch(3000);
        let ws_id = ws.meta.local_id.clone();
        fx.store.put(Record::Workspace(ws)).await.unwrap();

        let outcome = fx.handle.force_sync_now().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Succeeded { synced: 1 });

        // Upsert was keyed by the existing cloud id: no new remote record.
        assert_eq!(fx.cloud.len(), 1);
        assert!(fx.cloud.get("cloud-ws").is_some());

        let ws = fx
            .store
            .get(RecordKind::Workspace, &ws_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ws.meta().sync_version, 2);
        assert!(!ws.meta().is_pending());

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let fx = spawn_worker(fast_config());
        fx.cloud.fail_next(CloudError::Network("blip".into()));
        fx.cloud.fail_next(CloudError::Network("blip".into()));

        fx.store
            .put(Record::Workspace(Workspace::new("Team", 1000)))
            .await
            .unwrap();

        let outcome = fx.handle.force_sync_now().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Succeeded { synced: 1 });
        assert_eq!(fx.cloud.upsert_attempts(), 3);

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_record_but_not_cycle() {
        let fx = spawn_worker(fast_config());
        fx.cloud.fail_next(CloudError::Rejected("bad title".into()));

        // max_concurrent = 2 with the failing record first in updated_at
        // order, so the rejected record cannot starve the other.
        fx.store
            .put(Record::Workspace(Workspace::new("Bad", 1000)))
            .await
            .unwrap();
        fx.store
            .put(Record::Workspace(Workspace::new("Good", 2000)))
            .await
            .unwrap();

        let outcome = fx.handle.force_sync_now().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::PartiallyFailed {
                synced: 1,
                failed: 1
            }
        );
        // No retry for the rejected record.
        assert_eq!(fx.cloud.upsert_attempts(), 2);

        let status = fx.status.status();
        assert_eq!(status.failed_operations, 1);
        assert!(status.message.as_deref().unwrap().contains("bad title"));

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_ceiling_marks_record_failed() {
        let fx = spawn_worker(fast_config());
        for _ in 0..4 {
            fx.cloud.fail_next(CloudError::Network("down".into()));
        }

        fx.store
            .put(Record::Workspace(Workspace::new("Team", 1000)))
            .await
            .unwrap();

        let outcome = fx.handle.force_sync_now().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::PartiallyFailed {
                synced: 0,
                failed: 1
            }
        );
        // 1 attempt + max_retries = 3 total.
        assert_eq!(fx.cloud.upsert_attempts(), 3);

        // The record stays pending for the next cycle.
        let all = fx.store.read_all(RecordKind::Workspace).await.unwrap();
        assert!(all[0].meta().is_pending());

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_call_timeout_is_transient() {
        let fx = spawn_worker(SyncConfig {
            max_retries: 0,
            ..fast_config()
        });
        // Block the only upsert so the call times out.
        fx.cloud.block_upserts_after(0);

        fx.store
            .put(Record::Workspace(Workspace::new("Team", 1000)))
            .await
            .unwrap();

        let outcome = fx.handle.force_sync_now().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::PartiallyFailed {
                synced: 0,
                failed: 1
            }
        );
        let status = fx.status.status();
        assert!(status.message.as_deref().unwrap().contains("timed out"));

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_force_sync_twice_attaches_to_one_cycle() {
        let fx = spawn_worker(fast_config());
        // Stall the cycle on its first upsert.
        fx.cloud.block_upserts_after(0);

        for n in 0..3 {
            fx.store
                .put(Record::Workspace(Workspace::new(format!("ws-{}", n), 1000 + n)))
                .await
                .unwrap();
        }

        let rx1 = fx.handle.request_sync().unwrap();
        let rx2 = fx.handle.request_sync().unwrap();

        // Let the cycle start and both requests land, then open the gate.
        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.cloud.release_blocked(16);

        let outcome1 = rx1.await.unwrap();
        let outcome2 = rx2.await.unwrap();
        assert_eq!(outcome1, outcome2);
        assert_eq!(outcome1, CycleOutcome::Succeeded { synced: 3 });
        // Exactly one reconciliation pass: each record upserted once.
        assert_eq!(fx.cloud.upsert_attempts(), 3);

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_offline_mid_cycle_aborts_and_keeps_partial_work() {
        let fx = spawn_worker(SyncConfig {
            max_concurrent: 1,
            ..fast_config()
        });
        fx.cloud.block_upserts_after(3);

        for n in 0..10u64 {
            fx.store
                .put(Record::Document(Document::new(
                    format!("doc-{}", n),
                    "ws-1",
                    1000 + n,
                )))
                .await
                .unwrap();
        }

        let rx = fx.handle.request_sync().unwrap();

        // Wait for the first three records to land, then cut connectivity
        // while the fourth call is blocked in flight.
        for _ in 0..100 {
            if fx.cloud.upsert_count() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fx.cloud.upsert_count(), 3);
        fx.online_tx.send(false).unwrap();

        let outcome = rx.await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Aborted {
                synced: 3,
                remaining: 7
            }
        );

        let docs = fx.store.read_all(RecordKind::Document).await.unwrap();
        let synced: Vec<_> = docs.iter().filter(|d| d.meta().cloud_synced).collect();
        assert_eq!(synced.len(), 3);
        assert_eq!(docs.iter().filter(|d| d.meta().is_pending()).count(), 7);

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_force_sync_while_offline_aborts_immediately() {
        let fx = spawn_worker(fast_config());
        fx.online_tx.send(false).unwrap();

        fx.store
            .put(Record::Workspace(Workspace::new("Team", 1000)))
            .await
            .unwrap();

        let outcome = fx.handle.force_sync_now().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Aborted {
                synced: 0,
                remaining: 0
            }
        );
        assert_eq!(fx.cloud.upsert_attempts(), 0);

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_connectivity_restored_triggers_catch_up_cycle() {
        let fx = spawn_worker(fast_config());
        fx.online_tx.send(false).unwrap();

        fx.store
            .put(Record::Workspace(Workspace::new("Team", 1000)))
            .await
            .unwrap();

        fx.online_tx.send(true).unwrap();

        for _ in 0..100 {
            if fx.cloud.upsert_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fx.cloud.upsert_count(), 1);

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_interval_trigger_runs_cycle() {
        let fx = spawn_worker(SyncConfig {
            sync_interval: Duration::from_millis(30),
            ..fast_config()
        });

        fx.store
            .put(Record::Workspace(Workspace::new("Team", 1000)))
            .await
            .unwrap();

        for _ in 0..100 {
            if fx.cloud.upsert_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fx.cloud.upsert_count(), 1);

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_workspaces_sync_before_documents() {
        let fx = spawn_worker(SyncConfig {
            max_concurrent: 4,
            ..fast_config()
        });

        // Documents are older than the workspace; phase ordering must
        // still push the workspace first.
        for n in 0..3u64 {
            fx.store
                .put(Record::Document(Document::new(
                    format!("doc-{}", n),
                    "ws-1",
                    100 + n,
                )))
                .await
                .unwrap();
        }
        fx.store
            .put(Record::Workspace(Workspace::new("Team", 5000)))
            .await
            .unwrap();

        fx.handle.force_sync_now().await.unwrap();

        // All four upserted; the workspace landed before any document.
        assert_eq!(fx.cloud.upsert_count(), 4);

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_mid_cycle_finishes_cycle_first() {
        let fx = spawn_worker(fast_config());
        fx.cloud.block_upserts_after(0);

        fx.store
            .put(Record::Workspace(Workspace::new("Team", 1000)))
            .await
            .unwrap();

        let rx = fx.handle.request_sync().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Shutdown is queued behind the running cycle.
        let shutdown = tokio::spawn(fx.handle.shutdown());
        tokio::time::sleep(Duration::from_millis(20)).await;
        fx.cloud.release_blocked(16);

        let outcome = rx.await.unwrap();
        assert_eq!(outcome, CycleOutcome::Succeeded { synced: 1 });
        shutdown.await.unwrap();
    }
}
