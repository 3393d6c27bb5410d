//! quillpad-sync: local/remote synchronization core for Quillpad.
//!
//! This crate provides the core functionality for:
//! - Sync metadata and the record model for documents and workspaces
//! - RecordStore and CloudStore trait abstractions over the local and
//!   remote stores
//! - A publish/subscribe sync status manager
//! - A background sync worker with retry/backoff, bounded concurrency
//!   and cancellation on connectivity loss
//! - One-time guest-data migration into an authenticated account

pub mod cloud;
pub mod engine;
pub mod migration;
pub mod persistence;
pub mod record;
pub mod status;
pub mod store;
pub mod worker;

pub use cloud::{CloudError, CloudStore, InMemoryCloud, RemoteFilter, RemoteRecord};
pub use engine::{EngineError, SyncEngine};
pub use migration::{GuestDataSummary, GuestMigration, MigrationResult};
pub use persistence::JsonFileStore;
pub use record::{Document, Record, RecordKind, SyncMeta, Workspace};
pub use status::{DetailedSyncStatus, StatusSubscription, SyncStatus, SyncStatusManager};
pub use store::{InMemoryStore, RecordStore, StoreError};
pub use worker::{CycleOutcome, SyncConfig, SyncWorker, SyncWorkerHandle};
