//! RecordStore trait abstraction for the local record store.
//!
//! Implementations:
//! - `InMemoryStore` - For testing
//! - `JsonFileStore` (in persistence) - JSON files via tokio::fs
//!
//! The host application may also provide its own implementation over
//! whatever persistence it already uses.

use crate::record::{Record, RecordKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Corrupt record data: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Uniform read/write access to locally persisted records.
///
/// Implementations must be `Send + Sync`; the worker task and the host
/// share the store through an `Arc`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read all records of a kind, oldest `updated_at` first.
    async fn read_all(&self, kind: RecordKind) -> Result<Vec<Record>>;

    /// Look up a record by its local id.
    async fn get(&self, kind: RecordKind, local_id: &str) -> Result<Option<Record>>;

    /// Insert or replace a record, keyed by its `local_id`.
    async fn put(&self, record: Record) -> Result<()>;
}

/// In-memory record store for testing.
pub struct InMemoryStore {
    documents: RwLock<HashMap<String, Record>>,
    workspaces: RwLock<HashMap<String, Record>>,
    fail_reads: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            workspaces: RwLock::new(HashMap::new()),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Make subsequent reads fail, for exercising fatal-error paths.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn map_for(&self, kind: RecordKind) -> &RwLock<HashMap<String, Record>> {
        match kind {
            RecordKind::Document => &self.documents,
            RecordKind::Workspace => &self.workspaces,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn read_all(&self, kind: RecordKind) -> Result<Vec<Record>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Io("simulated read failure".into()));
        }
        let map = self.map_for(kind).read().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<Record> = map.values().cloned().collect();
        records.sort_by_key(|r| r.meta().updated_at);
        Ok(records)
    }

    async fn get(&self, kind: RecordKind, local_id: &str) -> Result<Option<Record>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Io("simulated read failure".into()));
        }
        let map = self.map_for(kind).read().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(local_id).cloned())
    }

    async fn put(&self, record: Record) -> Result<()> {
        let mut map = self
            .map_for(record.kind())
            .write()
            .unwrap_or_else(|e| e.into_inner());
        map.insert(record.local_id().to_string(), record);
        Ok(())
    }
}

// Implement RecordStore for Arc<T> where T: RecordStore
// This allows sharing a store between the engine and the host in tests
#[async_trait]
impl<T: RecordStore + Send + Sync> RecordStore for std::sync::Arc<T> {
    async fn read_all(&self, kind: RecordKind) -> Result<Vec<Record>> {
        (**self).read_all(kind).await
    }

    async fn get(&self, kind: RecordKind, local_id: &str) -> Result<Option<Record>> {
        (**self).get(kind, local_id).await
    }

    async fn put(&self, record: Record) -> Result<()> {
        (**self).put(record).await
    }
}
