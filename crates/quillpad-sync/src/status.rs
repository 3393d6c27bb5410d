//! Sync status: single source of truth for "what is the sync state right now".
//!
//! `SyncStatusManager` decouples producers (worker, migration, connectivity
//! listener) from consumers (host UI). Every mutating call recomputes the
//! authoritative status from raw counters/flags and synchronously notifies
//! all subscribers with a fresh immutable snapshot before returning.
//! No storage or network I/O happens here.

use crate::record::now_ms;
use crate::worker::CycleOutcome;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::debug;

/// Authoritative sync state. Highest-priority condition wins:
/// `Error` > `Offline` > `Syncing` > `Pending` > `Synced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Error,
    Offline,
    Syncing,
    Pending,
    Synced,
}

/// Immutable status snapshot delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedSyncStatus {
    pub status: SyncStatus,
    /// Reason for the most recent failed operation, if any.
    pub message: Option<String>,
    pub is_online: bool,
    pub sync_in_progress: bool,
    pub pending_uploads: usize,
    pub pending_downloads: usize,
    pub failed_operations: usize,
    pub conflicts_count: usize,
    /// Milliseconds since the Unix epoch; `None` until a cycle succeeds.
    pub last_successful_sync: Option<u64>,
}

/// Raw counters and flags the status is derived from.
struct StatusState {
    is_online: bool,
    sync_in_progress: bool,
    pending_uploads: usize,
    pending_downloads: usize,
    failed_operations: usize,
    conflicts_count: usize,
    last_successful_sync: Option<u64>,
    message: Option<String>,
}

impl StatusState {
    fn new() -> Self {
        Self {
            is_online: true,
            sync_in_progress: false,
            pending_uploads: 0,
            pending_downloads: 0,
            failed_operations: 0,
            conflicts_count: 0,
            last_successful_sync: None,
            message: None,
        }
    }

    fn derive(&self) -> SyncStatus {
        if self.failed_operations > 0 {
            SyncStatus::Error
        } else if !self.is_online {
            SyncStatus::Offline
        } else if self.sync_in_progress {
            SyncStatus::Syncing
        } else if self.pending_uploads > 0 || self.pending_downloads > 0 {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        }
    }

    fn snapshot(&self) -> DetailedSyncStatus {
        DetailedSyncStatus {
            status: self.derive(),
            message: self.message.clone(),
            is_online: self.is_online,
            sync_in_progress: self.sync_in_progress,
            pending_uploads: self.pending_uploads,
            pending_downloads: self.pending_downloads,
            failed_operations: self.failed_operations,
            conflicts_count: self.conflicts_count,
            last_successful_sync: self.last_successful_sync,
        }
    }
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving
/// snapshots, drop it (or let it go out of scope) to unsubscribe.
pub struct StatusSubscription {
    manager: Weak<SyncStatusManager>,
    id: usize,
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.unsubscribe(self.id);
        }
    }
}

type Listener = Arc<dyn Fn(DetailedSyncStatus) + Send + Sync>;

/// Publish/subscribe holder for the derived sync status.
///
/// Thread-safe for use from the worker task and host threads.
/// Wrap in `Arc` to enable subscriptions.
pub struct SyncStatusManager {
    state: RwLock<StatusState>,
    subscribers: RwLock<Vec<(usize, Listener)>>,
    next_id: AtomicUsize,
}

impl Default for SyncStatusManager {
    fn default() -> Self {
        Self {
            state: RwLock::new(StatusState::new()),
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl SyncStatusManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to status changes. The listener is invoked immediately
    /// with the current snapshot, then after every subsequent change.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(DetailedSyncStatus) + Send + Sync + 'static,
    ) -> StatusSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let listener: Listener = Arc::new(listener);
        listener(self.status());
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        StatusSubscription {
            manager: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // Use try_write to avoid deadlock if Drop runs during panic
        // unwinding while a read lock is held (e.g., during broadcast).
        if let Ok(mut guard) = self.subscribers.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Current snapshot without subscribing.
    pub fn status(&self) -> DetailedSyncStatus {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot()
    }

    /// A reconciliation cycle entered `Running`.
    pub fn report_cycle_start(&self) {
        self.mutate(|s| s.sync_in_progress = true);
    }

    /// A reconciliation cycle finished with `outcome`.
    ///
    /// `last_successful_sync` moves only on a success, or a partial
    /// failure that still pushed at least one record.
    pub fn report_cycle_end(&self, outcome: &CycleOutcome) {
        self.mutate(|s| {
            s.sync_in_progress = false;
            match outcome {
                CycleOutcome::Succeeded { .. } => s.last_successful_sync = Some(now_ms()),
                CycleOutcome::PartiallyFailed { synced, .. } if *synced > 0 => {
                    s.last_successful_sync = Some(now_ms())
                }
                _ => {}
            }
        });
    }

    /// Connectivity transitioned to `is_online`.
    pub fn report_connectivity(&self, is_online: bool) {
        debug!("Connectivity changed: online={}", is_online);
        self.mutate(|s| s.is_online = is_online);
    }

    /// An operation exhausted its retries or was rejected.
    pub fn record_failed_operation(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.mutate(|s| {
            s.failed_operations += 1;
            s.message = Some(reason);
        });
    }

    /// A name collision was resolved by rename.
    pub fn record_conflict(&self) {
        self.mutate(|s| s.conflicts_count += 1);
    }

    /// Dismiss accumulated failures. Idempotent.
    pub fn clear_errors(&self) {
        self.mutate(|s| {
            s.failed_operations = 0;
            s.message = None;
        });
    }

    /// Number of local records still awaiting upload.
    pub fn set_pending_uploads(&self, count: usize) {
        self.mutate(|s| s.pending_uploads = count);
    }

    fn mutate(&self, f: impl FnOnce(&mut StatusState)) {
        let snapshot = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            f(&mut state);
            state.snapshot()
        };
        self.broadcast(snapshot);
    }

    fn broadcast(&self, snapshot: DetailedSyncStatus) {
        // Clone the listener list to prevent deadlock if a listener
        // subscribes or drops a subscription from within the callback.
        let listeners: Vec<Listener> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            listener(snapshot.clone());
        }
    }
}
