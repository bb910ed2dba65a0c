//! Multi-backend version storage for creative production assets.
//!
//! The design separates *what* a version is from *where* its bytes live.
//! A logical version is a file plus an immutable [`AssetMetadata`] record;
//! where it lives is the business of a [`StorageBackend`] — a
//! content-addressed directory tree ([`DiskStore`]), a branch-per-version
//! git repository ([`BranchStore`]), or a changelist-based system
//! ([`ChangelistStore`]). All backends satisfy the same store / retrieve /
//! describe / promote / enumerate contract, so the layers above never touch
//! a storage technology directly.
//!
//! [`VersionManager`] fans a single logical version out across a configured
//! set of backends and, when a [`VersionRepository`] is attached, records
//! the canonical cross-backend index entry for it. Writes are strictly
//! sequential and best-effort forward: a backend failure aborts the fan-out
//! without undoing earlier backends, and the repository index only ever
//! lists locations that actually succeeded.
//!
//! [`HistoryReconciler`] goes the other way: it gathers the references each
//! backend already holds and merges them into one summary and a best-effort
//! timeline, tolerating individual backends that fail to enumerate.
//!
//! Nothing here is async; every operation is plain blocking I/O. Backends
//! that mutate shared checkout state (branches, changelists) are
//! single-writer-per-instance, which the `&mut self` receivers encode.
//!
//! [`AssetMetadata`]: metadata::AssetMetadata
//! [`StorageBackend`]: storage::StorageBackend
//! [`DiskStore`]: storage::disk::DiskStore
//! [`BranchStore`]: storage::branch::BranchStore
//! [`ChangelistStore`]: storage::changelist::ChangelistStore
//! [`VersionManager`]: manager::VersionManager
//! [`VersionRepository`]: repo::VersionRepository
//! [`HistoryReconciler`]: history::HistoryReconciler

pub mod error;
pub mod history;
pub mod manager;
pub mod metadata;
pub mod repo;
pub mod storage;

pub use error::{Result, VaultError};
pub use history::HistoryReconciler;
pub use manager::{VersionIdentifier, VersionManager};
pub use metadata::{AssetMetadata, MetadataMap};
pub use repo::{StorageLocation, VersionQuery, VersionRecord, VersionRepository};
pub use storage::{BackendSet, ReferenceType, StorageBackend, StorageReference};
