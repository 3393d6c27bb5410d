//! Record model shared by documents and workspaces.
//!
//! Every syncable record embeds `SyncMeta`: the identifiers, flags and
//! counters the engine uses to decide what still needs to be pushed to the
//! cloud store. Records created before sign-in carry no `owner_id` and are
//! "guest" records until the migration promotes them.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Kind of syncable record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Document,
    Workspace,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Document => "document",
            RecordKind::Workspace => "workspace",
        }
    }
}

/// Sync metadata carried by every record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    /// Stable identifier assigned at local creation. Immutable.
    pub local_id: String,
    /// Identifier assigned by the remote store; `None` until the first
    /// successful sync.
    #[serde(default)]
    pub cloud_id: Option<String>,
    /// True once the record has a remote counterpart matching the last
    /// known local state.
    #[serde(default)]
    pub cloud_synced: bool,
    /// Incremented on every successful push. Never decreases.
    #[serde(default)]
    pub sync_version: u64,
    /// Last local modification, in milliseconds since the Unix epoch.
    pub updated_at: u64,
    /// Last successful push, in milliseconds since the Unix epoch.
    /// Zero means never synced.
    #[serde(default)]
    pub last_sync_at: u64,
    /// Owning account. `None` for guest records.
    #[serde(default)]
    pub owner_id: Option<String>,
}

impl SyncMeta {
    /// Fresh metadata for a record created locally (not yet synced).
    pub fn new_local(now: u64) -> Self {
        Self {
            local_id: Uuid::new_v4().to_string(),
            cloud_id: None,
            cloud_synced: false,
            sync_version: 0,
            updated_at: now,
            last_sync_at: 0,
            owner_id: None,
        }
    }

    /// Whether this record still has changes the remote store hasn't seen.
    pub fn is_pending(&self) -> bool {
        !self.cloud_synced || self.updated_at > self.last_sync_at
    }

    /// Record a successful push: the remote counterpart now matches the
    /// local state. `sync_version` only ever moves forward.
    pub fn mark_synced(&mut self, cloud_id: String, now: u64) {
        self.cloud_id = Some(cloud_id);
        self.cloud_synced = true;
        self.sync_version = self.sync_version.saturating_add(1);
        self.last_sync_at = now;
    }

    /// Record a local modification.
    pub fn touch(&mut self, now: u64) {
        self.updated_at = now;
    }
}

/// A workspace: a named container for documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    #[serde(flatten)]
    pub meta: SyncMeta,
    pub name: String,
}

impl Workspace {
    pub fn new(name: impl Into<String>, now: u64) -> Self {
        Self {
            meta: SyncMeta::new_local(now),
            name: name.into(),
        }
    }
}

/// A document belonging to a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(flatten)]
    pub meta: SyncMeta,
    pub title: String,
    /// Foreign key to the containing workspace. Rewritten by the guest
    /// migration when the workspace itself is migrated.
    #[serde(rename = "workspaceId")]
    pub workspace_id: String,
    pub content: String,
}

impl Document {
    pub fn new(title: impl Into<String>, workspace_id: impl Into<String>, now: u64) -> Self {
        Self {
            meta: SyncMeta::new_local(now),
            title: title.into(),
            workspace_id: workspace_id.into(),
            content: String::new(),
        }
    }
}

/// A kind-tagged record, the unit the `RecordStore` works with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Record {
    Document(Document),
    Workspace(Workspace),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Document(_) => RecordKind::Document,
            Record::Workspace(_) => RecordKind::Workspace,
        }
    }

    pub fn meta(&self) -> &SyncMeta {
        match self {
            Record::Document(doc) => &doc.meta,
            Record::Workspace(ws) => &ws.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut SyncMeta {
        match self {
            Record::Document(doc) => &mut doc.meta,
            Record::Workspace(ws) => &mut ws.meta,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.meta().local_id
    }

    /// Document title or workspace name, for collision checks and logs.
    pub fn display_name(&self) -> &str {
        match self {
            Record::Document(doc) => &doc.title,
            Record::Workspace(ws) => &ws.name,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Record::Document(doc) => Some(doc),
            Record::Workspace(_) => None,
        }
    }

    pub fn as_workspace(&self) -> Option<&Workspace> {
        match self {
            Record::Workspace(ws) => Some(ws),
            Record::Document(_) => None,
        }
    }

    pub fn into_document(self) -> Option<Document> {
        match self {
            Record::Document(doc) => Some(doc),
            Record::Workspace(_) => None,
        }
    }

    pub fn into_workspace(self) -> Option<Workspace> {
        match self {
            Record::Workspace(ws) => Some(ws),
            Record::Document(_) => None,
        }
    }
}
