//! Guest data migration: one-shot promotion of locally-created records
//! into a newly authenticated account.
//!
//! This is the most failure-sensitive part of the engine: it rewrites
//! document foreign keys and must never duplicate or silently drop data.
//! Batch semantics are partial-failure: an individual record that cannot
//! be migrated appends to `MigrationResult::errors` and the batch
//! continues. Only a failed local-store read aborts the whole call.
//!
//! The migration is idempotent: records already promoted are filtered out
//! up front, so re-invoking after a partial failure retries exactly the
//! records still marked unsynced.

use crate::cloud::{CloudError, CloudStore, RemoteFilter, RemoteRecord};
use crate::record::{Document, Record, RecordKind, Workspace, now_ms};
use crate::status::SyncStatusManager;
use crate::store::{RecordStore, StoreError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Deterministic disambiguation suffix for name collisions.
const COLLISION_SUFFIX: &str = " (Local)";

/// Result of one migration invocation. Returned to the caller, never
/// persisted. `success` is true only when `errors` is empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
    pub success: bool,
    pub documents_migrated: usize,
    pub workspaces_migrated: usize,
    pub errors: Vec<String>,
}

impl MigrationResult {
    fn empty_success() -> Self {
        Self {
            success: true,
            documents_migrated: 0,
            workspaces_migrated: 0,
            errors: Vec::new(),
        }
    }

    fn fatal(message: String) -> Self {
        Self {
            success: false,
            documents_migrated: 0,
            workspaces_migrated: 0,
            errors: vec![message],
        }
    }
}

/// Counts of guest records still awaiting migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestDataSummary {
    pub document_count: usize,
    pub workspace_count: usize,
}

#[derive(Debug, Error)]
enum MigrateItemError {
    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("local store error: {0}")]
    Store(#[from] StoreError),
}

/// One-shot promotion of guest records into an authenticated account.
pub struct GuestMigration {
    store: Arc<dyn RecordStore>,
    cloud: Arc<dyn CloudStore>,
    status: Arc<SyncStatusManager>,
    guard: Arc<Mutex<()>>,
}

impl GuestMigration {
    pub fn new(
        store: Arc<dyn RecordStore>,
        cloud: Arc<dyn CloudStore>,
        status: Arc<SyncStatusManager>,
        guard: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            store,
            cloud,
            status,
            guard,
        }
    }

    /// Promote every guest record into `account_id`.
    ///
    /// Workspaces migrate first so documents can remap their
    /// `workspace_id` through the freshly assigned remote ids. Holds the
    /// engine guard for the duration, so a background sync cycle never
    /// touches the same records concurrently.
    pub async fn migrate(&self, account_id: &str) -> MigrationResult {
        let _guard = self.guard.lock().await;
        info!("Starting guest data migration for account {}", account_id);

        let workspaces = match self.store.read_all(RecordKind::Workspace).await {
            Ok(records) => records,
            Err(e) => return Self::fatal_read(RecordKind::Workspace, e),
        };
        let documents = match self.store.read_all(RecordKind::Document).await {
            Ok(records) => records,
            Err(e) => return Self::fatal_read(RecordKind::Document, e),
        };

        let guest_workspaces: Vec<Workspace> = workspaces
            .into_iter()
            .filter(|r| !r.meta().cloud_synced)
            .filter_map(Record::into_workspace)
            .collect();
        let guest_documents: Vec<Document> = documents
            .into_iter()
            .filter(|r| !r.meta().cloud_synced)
            .filter_map(Record::into_document)
            .collect();

        if guest_workspaces.is_empty() && guest_documents.is_empty() {
            debug!("No guest data to migrate");
            return MigrationResult::empty_success();
        }

        let mut errors = Vec::new();
        // Transient remap table, scoped to this invocation:
        // local workspace id -> remote workspace id.
        let mut workspace_map: HashMap<String, String> = HashMap::new();
        let mut workspaces_migrated = 0;

        for mut ws in guest_workspaces {
            let local_id = ws.meta.local_id.clone();
            match self.migrate_workspace(&mut ws, account_id).await {
                Ok(remote_id) => {
                    workspace_map.insert(local_id, remote_id);
                    workspaces_migrated += 1;
                }
                Err(e) => {
                    let msg = format!("workspace \"{}\" ({}): {}", ws.name, local_id, e);
                    warn!("Migration error: {}", msg);
                    self.status.record_failed_operation(msg.clone());
                    errors.push(msg);
                }
            }
        }

        let mut documents_migrated = 0;
        for mut doc in guest_documents {
            let local_id = doc.meta.local_id.clone();
            match self
                .migrate_document(&mut doc, account_id, &workspace_map)
                .await
            {
                Ok(_) => documents_migrated += 1,
                Err(e) => {
                    let msg = format!("document \"{}\" ({}): {}", doc.title, local_id, e);
                    warn!("Migration error: {}", msg);
                    self.status.record_failed_operation(msg.clone());
                    errors.push(msg);
                }
            }
        }

        info!(
            "Guest migration finished: {} workspace(s), {} document(s), {} error(s)",
            workspaces_migrated,
            documents_migrated,
            errors.len()
        );

        MigrationResult {
            success: errors.is_empty(),
            documents_migrated,
            workspaces_migrated,
            errors,
        }
    }

    fn fatal_read(kind: RecordKind, e: StoreError) -> MigrationResult {
        let msg = format!("could not read local {} records: {}", kind.as_str(), e);
        warn!("Migration aborted: {}", msg);
        MigrationResult::fatal(msg)
    }

    async fn migrate_workspace(
        &self,
        ws: &mut Workspace,
        account_id: &str,
    ) -> Result<String, MigrateItemError> {
        ws.name = self
            .deduped_name(RecordKind::Workspace, account_id, &ws.name)
            .await?;

        // Migration always creates a new remote record; the collision
        // check above prevents a silent merge with an unrelated one.
        let remote_id = self
            .cloud
            .upsert(RemoteRecord {
                id: None,
                kind: RecordKind::Workspace,
                owner_id: Some(account_id.to_string()),
                name: ws.name.clone(),
                workspace_id: None,
                payload: serde_json::json!({
                    "localId": ws.meta.local_id,
                    "syncVersion": ws.meta.sync_version,
                }),
            })
            .await?;

        ws.meta.owner_id = Some(account_id.to_string());
        ws.meta.mark_synced(remote_id.clone(), now_ms());
        self.store.put(Record::Workspace(ws.clone())).await?;

        debug!(
            "Migrated workspace \"{}\" ({} -> {})",
            ws.name, ws.meta.local_id, remote_id
        );
        Ok(remote_id)
    }

    async fn migrate_document(
        &self,
        doc: &mut Document,
        account_id: &str,
        workspace_map: &HashMap<String, String>,
    ) -> Result<String, MigrateItemError> {
        // Remap to the migrated workspace's remote id. A miss means the
        // document already pointed at a shared/cloud workspace; keep the
        // original id.
        if let Some(remote_ws) = workspace_map.get(&doc.workspace_id) {
            doc.workspace_id = remote_ws.clone();
        }

        doc.title = self
            .deduped_name(RecordKind::Document, account_id, &doc.title)
            .await?;

        let remote_id = self
            .cloud
            .upsert(RemoteRecord {
                id: None,
                kind: RecordKind::Document,
                owner_id: Some(account_id.to_string()),
                name: doc.title.clone(),
                workspace_id: Some(doc.workspace_id.clone()),
                payload: serde_json::json!({
                    "localId": doc.meta.local_id,
                    "content": doc.content,
                    "syncVersion": doc.meta.sync_version,
                }),
            })
            .await?;

        doc.meta.owner_id = Some(account_id.to_string());
        doc.meta.mark_synced(remote_id.clone(), now_ms());
        self.store.put(Record::Document(doc.clone())).await?;

        debug!(
            "Migrated document \"{}\" ({} -> {})",
            doc.title, doc.meta.local_id, remote_id
        );
        Ok(remote_id)
    }

    /// Check the account for an existing record with the same name and
    /// return a disambiguated one if so.
    async fn deduped_name(
        &self,
        kind: RecordKind,
        account_id: &str,
        name: &str,
    ) -> Result<String, CloudError> {
        let existing = self
            .cloud
            .list(kind, account_id, &RemoteFilter::by_name(name))
            .await?;
        if existing.is_empty() {
            return Ok(name.to_string());
        }

        let renamed = format!("{}{}", name, COLLISION_SUFFIX);
        info!(
            "Name collision for {} \"{}\": migrating as \"{}\"",
            kind.as_str(),
            name,
            renamed
        );
        self.status.record_conflict();
        Ok(renamed)
    }

    /// Whether any guest records exist locally.
    pub async fn has_guest_data(&self) -> Result<bool, StoreError> {
        let summary = self.guest_data_summary().await?;
        Ok(summary.document_count + summary.workspace_count > 0)
    }

    /// Counts of guest records, for onboarding UI.
    pub async fn guest_data_summary(&self) -> Result<GuestDataSummary, StoreError> {
        let count = |records: Vec<Record>| {
            records
                .iter()
                .filter(|r| !r.meta().cloud_synced)
                .count()
        };
        Ok(GuestDataSummary {
            document_count: count(self.store.read_all(RecordKind::Document).await?),
            workspace_count: count(self.store.read_all(RecordKind::Workspace).await?),
        })
    }

    /// True when nothing is left to migrate for `account_id`: no guest
    /// records remain and every record is synced into that account.
    pub async fn is_user_fully_migrated(&self, account_id: &str) -> Result<bool, StoreError> {
        for kind in [RecordKind::Workspace, RecordKind::Document] {
            for record in self.store.read_all(kind).await? {
                let meta = record.meta();
                if !meta.cloud_synced || meta.owner_id.as_deref() != Some(account_id) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}
