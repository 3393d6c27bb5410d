//! CloudStore trait for the remote record store.
//!
//! Only the contract the sync core needs is modeled here: owner-scoped
//! upsert and filtered listing (for collision checks). The transport to
//! the actual cloud service lives in the host application.

use crate::record::RecordKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error)]
pub enum CloudError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Rejected by remote store: {0}")]
    Rejected(String),
}

impl CloudError {
    /// Transient failures are retried with backoff; permanent ones are
    /// recorded and skipped for the rest of the cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::Network(_) | CloudError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;

/// A record as the remote store sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    /// Remote id. `None` asks the store to create a new record; a present
    /// id updates the existing one.
    pub id: Option<String>,
    pub kind: RecordKind,
    pub owner_id: Option<String>,
    /// Workspace name or document title.
    pub name: String,
    /// Remote workspace id (documents only).
    pub workspace_id: Option<String>,
    /// Remaining record fields (content, local id, sync version).
    pub payload: serde_json::Value,
}

/// Filter for `CloudStore::list`.
#[derive(Debug, Clone, Default)]
pub struct RemoteFilter {
    /// Exact name/title match.
    pub name: Option<String>,
}

impl RemoteFilter {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

/// Remote store contract consumed by the worker and the migration.
#[async_trait]
pub trait CloudStore: Send + Sync {
    /// Create or update a record. Returns the remote id.
    async fn upsert(&self, record: RemoteRecord) -> Result<String>;

    /// List records owned by `owner_id`, narrowed by `filter`.
    async fn list(
        &self,
        kind: RecordKind,
        owner_id: &str,
        filter: &RemoteFilter,
    ) -> Result<Vec<RemoteRecord>>;
}

/// In-memory cloud store for testing.
///
/// Supports scripted failures (`fail_next`) and an upsert gate
/// (`block_upserts_after`) so tests can stall a sync cycle at a known
/// point and then cut connectivity or release it.
pub struct InMemoryCloud {
    records: RwLock<HashMap<String, RemoteRecord>>,
    fail_queue: Mutex<VecDeque<CloudError>>,
    attempts: AtomicUsize,
    completed: AtomicUsize,
    gate_after: AtomicUsize,
    gate: tokio::sync::Semaphore,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            fail_queue: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            gate_after: AtomicUsize::new(usize::MAX),
            gate: tokio::sync::Semaphore::new(0),
        }
    }

    /// Queue an error returned by the next upsert attempt (FIFO).
    pub fn fail_next(&self, err: CloudError) {
        self.fail_queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(err);
    }

    /// Block every upsert attempt after the first `n`, until
    /// `release_blocked` grants permits. Blocked calls suspend
    /// cooperatively and are cancelled if their future is dropped.
    pub fn block_upserts_after(&self, n: usize) {
        self.gate_after.store(n, Ordering::SeqCst);
    }

    /// Let `n` blocked (or future) upserts proceed.
    pub fn release_blocked(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Number of upsert attempts, including failed and blocked ones.
    pub fn upsert_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Number of upserts that completed successfully.
    pub fn upsert_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Snapshot of a stored record, by remote id.
    pub fn get(&self, id: &str) -> Option<RemoteRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Total number of stored records.
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudStore for InMemoryCloud {
    async fn upsert(&self, mut record: RemoteRecord) -> Result<String> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt >= self.gate_after.load(Ordering::SeqCst) {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| CloudError::Network("gate closed".into()))?;
            permit.forget();
        }

        if let Some(err) = self
            .fail_queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return Err(err);
        }

        let id = match record.id.clone() {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                record.id = Some(id.clone());
                id
            }
        };

        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), record);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn list(
        &self,
        kind: RecordKind,
        owner_id: &str,
        filter: &RemoteFilter,
    ) -> Result<Vec<RemoteRecord>> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .values()
            .filter(|r| r.kind == kind)
            .filter(|r| r.owner_id.as_deref() == Some(owner_id))
            .filter(|r| match &filter.name {
                Some(name) => &r.name == name,
                None => true,
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn remote_workspace(name: &str, owner: &str) -> RemoteRecord {
        RemoteRecord {
            id: None,
            kind: RecordKind::Workspace,
            owner_id: Some(owner.to_string()),
            name: name.to_string(),
            workspace_id: None,
            payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_error_classification() {
        assert!(CloudError::Network("down".into()).is_transient());
        assert!(CloudError::Timeout("slow".into()).is_transient());
        assert!(!CloudError::Rejected("bad payload".into()).is_transient());
    }

    #[tokio::test]
    async fn test_upsert_assigns_id_once() {
        let cloud = InMemoryCloud::new();
        let id = cloud.upsert(remote_workspace("Team", "u1")).await.unwrap();

        // Updating with the same id replaces instead of duplicating.
        let mut update = remote_workspace("Team renamed", "u1");
        update.id = Some(id.clone());
        let id2 = cloud.upsert(update).await.unwrap();

        assert_eq!(id, id2);
        assert_eq!(cloud.len(), 1);
        assert_eq!(cloud.get(&id).unwrap().name, "Team renamed");
    }

    #[tokio::test]
    async fn test_list_filters_by_owner_and_name() {
        let cloud = InMemoryCloud::new();
        cloud.upsert(remote_workspace("Team", "u1")).await.unwrap();
        cloud.upsert(remote_workspace("Team", "u2")).await.unwrap();
        cloud.upsert(remote_workspace("Home", "u1")).await.unwrap();

        let filter = RemoteFilter::by_name("Team");
        let hits = cloud
            .list(RecordKind::Workspace, "u1", &filter)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].owner_id.as_deref(), Some("u1"));

        let all = cloud
            .list(RecordKind::Workspace, "u1", &RemoteFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_fail_next_is_consumed_in_order() {
        let cloud = InMemoryCloud::new();
        cloud.fail_next(CloudError::Network("one".into()));
        cloud.fail_next(CloudError::Rejected("two".into()));

        let err = cloud
            .upsert(remote_workspace("Team", "u1"))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let err = cloud
            .upsert(remote_workspace("Team", "u1"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());

        assert!(cloud.upsert(remote_workspace("Team", "u1")).await.is_ok());
        assert_eq!(cloud.upsert_attempts(), 3);
        assert_eq!(cloud.upsert_count(), 1);
    }

    #[tokio::test]
    async fn test_gate_blocks_and_releases() {
        let cloud = std::sync::Arc::new(InMemoryCloud::new());
        cloud.block_upserts_after(1);

        cloud.upsert(remote_workspace("a", "u1")).await.unwrap();

        let blocked = {
            let cloud = std::sync::Arc::clone(&cloud);
            tokio::spawn(async move { cloud.upsert(remote_workspace("b", "u1")).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());
        assert_eq!(cloud.upsert_count(), 1);

        cloud.release_blocked(1);
        blocked.await.unwrap().unwrap();
        assert_eq!(cloud.upsert_count(), 2);
    }
}
