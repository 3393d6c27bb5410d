//! SyncEngine: the lifecycle-owned object wiring the sync core together.
//!
//! The host constructs one engine over its record store and cloud store,
//! keeps it for the lifetime of the session, and drives connectivity
//! through [`SyncEngine::set_online`]. There is no ambient global state:
//! everything lives on the engine and is dropped with it.
//!
//! The engine owns the guard that serializes background sync cycles and
//! guest migration, so the two never reconcile the same records
//! concurrently.

use crate::cloud::CloudStore;
use crate::migration::{GuestDataSummary, GuestMigration, MigrationResult};
use crate::status::{DetailedSyncStatus, StatusSubscription, SyncStatusManager};
use crate::store::{RecordStore, StoreError};
use crate::worker::{CycleOutcome, SyncConfig, SyncWorker, SyncWorkerHandle, WorkerError};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::debug;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("sync worker: {0}")]
    Worker(#[from] WorkerError),

    #[error("local store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// The synchronization engine.
pub struct SyncEngine {
    store: Arc<dyn RecordStore>,
    cloud: Arc<dyn CloudStore>,
    status: Arc<SyncStatusManager>,
    config: SyncConfig,
    online_tx: watch::Sender<bool>,
    guard: Arc<Mutex<()>>,
    migration: GuestMigration,
    worker: StdMutex<Option<SyncWorkerHandle>>,
}

impl SyncEngine {
    /// Build an engine over the given stores. The worker does not run
    /// until [`SyncEngine::start`] is called; migration and the
    /// introspection APIs work either way.
    pub fn new(
        store: Arc<dyn RecordStore>,
        cloud: Arc<dyn CloudStore>,
        config: SyncConfig,
    ) -> Self {
        let status = Arc::new(SyncStatusManager::new());
        let (online_tx, _) = watch::channel(true);
        let guard = Arc::new(Mutex::new(()));
        let migration = GuestMigration::new(
            Arc::clone(&store),
            Arc::clone(&cloud),
            Arc::clone(&status),
            Arc::clone(&guard),
        );
        Self {
            store,
            cloud,
            status,
            config,
            online_tx,
            guard,
            migration,
            worker: StdMutex::new(None),
        }
    }

    /// Spawn the background sync worker. A second call is a no-op.
    pub fn start(&self) {
        let mut slot = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            debug!("Sync worker already running");
            return;
        }
        let worker = SyncWorker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.cloud),
            Arc::clone(&self.status),
            self.config.clone(),
            self.online_tx.subscribe(),
            Arc::clone(&self.guard),
        );
        *slot = Some(worker.spawn());
    }

    /// Stop the worker task, letting an in-flight cycle finish first.
    /// A no-op if the worker was never started.
    pub async fn shutdown(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }

    /// Feed the connectivity signal. Edges propagate to the status
    /// manager and to the worker (restoring connectivity triggers a
    /// catch-up cycle; losing it aborts a running one).
    pub fn set_online(&self, online: bool) {
        let changed = self.online_tx.send_if_modified(|current| {
            if *current != online {
                *current = online;
                true
            } else {
                false
            }
        });
        if changed {
            self.status.report_connectivity(online);
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> DetailedSyncStatus {
        self.status.status()
    }

    /// Subscribe to status snapshots. The listener fires immediately
    /// with the current snapshot and on every change until the returned
    /// handle is dropped.
    pub fn subscribe_sync_status(
        &self,
        listener: impl Fn(DetailedSyncStatus) + Send + Sync + 'static,
    ) -> StatusSubscription {
        self.status.subscribe(listener)
    }

    /// Dismiss accumulated sync errors.
    pub fn clear_errors(&self) {
        self.status.clear_errors();
    }

    /// Trigger a reconciliation cycle, or attach to the one already in
    /// flight, and wait for its outcome.
    pub async fn force_sync_now(&self) -> Result<CycleOutcome> {
        let rx = {
            let slot = self.worker.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(handle) => handle.request_sync()?,
                None => return Err(EngineError::Worker(WorkerError::NotRunning)),
            }
        };
        rx.await
            .map_err(|_| EngineError::Worker(WorkerError::NotRunning))
    }

    /// Promote all guest records into `account_id`. Serialized against
    /// background sync cycles; call once after sign-up/sign-in.
    pub async fn migrate_guest_data(&self, account_id: &str) -> MigrationResult {
        self.migration.migrate(account_id).await
    }

    /// Whether any guest records exist locally.
    pub async fn has_guest_data(&self) -> Result<bool> {
        Ok(self.migration.has_guest_data().await?)
    }

    /// Counts of guest records, for onboarding UI.
    pub async fn guest_data_summary(&self) -> Result<GuestDataSummary> {
        Ok(self.migration.guest_data_summary().await?)
    }

    /// Whether every local record is synced into `account_id`.
    pub async fn is_user_fully_migrated(&self, account_id: &str) -> Result<bool> {
        Ok(self.migration.is_user_fully_migrated(account_id).await?)
    }
}
