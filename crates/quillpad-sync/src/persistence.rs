//! JSON-file persistence for local records.
//!
//! Stores records as `documents.json` and `workspaces.json` within a
//! directory, loading them into an in-memory cache at startup and writing
//! through on every put. Suited to the desktop host, where record counts
//! stay small.

use crate::record::{Record, RecordKind};
use crate::store::{RecordStore, Result, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::fs;
use tracing::{debug, warn};

/// File-backed record store.
pub struct JsonFileStore {
    dir: PathBuf,
    documents: RwLock<HashMap<String, Record>>,
    workspaces: RwLock<HashMap<String, Record>>,
}

impl JsonFileStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    /// Missing files mean a fresh install and load as empty.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;

        let store = Self {
            documents: RwLock::new(HashMap::new()),
            workspaces: RwLock::new(HashMap::new()),
            dir,
        };
        for kind in [RecordKind::Document, RecordKind::Workspace] {
            let loaded = store.load(kind).await?;
            debug!("Loaded {} {} record(s)", loaded.len(), kind.as_str());
            *store.map_for(kind).write().unwrap_or_else(|e| e.into_inner()) = loaded;
        }
        Ok(store)
    }

    fn file_for(&self, kind: RecordKind) -> PathBuf {
        match kind {
            RecordKind::Document => self.dir.join("documents.json"),
            RecordKind::Workspace => self.dir.join("workspaces.json"),
        }
    }

    fn map_for(&self, kind: RecordKind) -> &RwLock<HashMap<String, Record>> {
        match kind {
            RecordKind::Document => &self.documents,
            RecordKind::Workspace => &self.workspaces,
        }
    }

    async fn load(&self, kind: RecordKind) -> Result<HashMap<String, Record>> {
        let path = self.file_for(kind);
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let bytes = fs::read(&path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let records: Vec<Record> = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e)))?;

        let mut map = HashMap::new();
        for record in records {
            if record.kind() != kind {
                warn!(
                    "Skipping {} record {} found in {}",
                    record.kind().as_str(),
                    record.local_id(),
                    path.display()
                );
                continue;
            }
            map.insert(record.local_id().to_string(), record);
        }
        Ok(map)
    }

    async fn persist(&self, kind: RecordKind) -> Result<()> {
        let mut records: Vec<Record> = {
            let map = self.map_for(kind).read().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        // Stable file contents across runs.
        records.sort_by(|a, b| a.local_id().cmp(b.local_id()));

        let json = serde_json::to_vec_pretty(&records)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        fs::write(self.file_for(kind), json)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    /// Directory this store persists into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn read_all(&self, kind: RecordKind) -> Result<Vec<Record>> {
        let map = self.map_for(kind).read().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<Record> = map.values().cloned().collect();
        records.sort_by_key(|r| r.meta().updated_at);
        Ok(records)
    }

    async fn get(&self, kind: RecordKind, local_id: &str) -> Result<Option<Record>> {
        let map = self.map_for(kind).read().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(local_id).cloned())
    }

    async fn put(&self, record: Record) -> Result<()> {
        let kind = record.kind();
        {
            let mut map = self.map_for(kind).write().unwrap_or_else(|e| e.into_inner());
            map.insert(record.local_id().to_string(), record);
        }
        self.persist(kind).await
    }
}
