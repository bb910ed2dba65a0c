//! The uniform storage backend contract and the types that cross it.
//!
//! A backend owns exactly one storage technology and exposes the same five
//! operations regardless of what sits underneath: persist a file
//! ([`store`]), get bytes back ([`retrieve`]), read the metadata record
//! ([`describe`]), promote content the backend already holds into a
//! tracked version ([`create_from_reference`]), and enumerate what exists
//! ([`list_references`]). The variant set is closed — disk, branch,
//! changelist, memory — and new kinds join by implementing the trait;
//! neither the orchestrator nor the reconciler is touched.
//!
//! Storage ids are opaque and scoped to one backend. Equal ids in two
//! different backends mean nothing.
//!
//! Every method takes `&mut self`: the branch and changelist backends
//! mutate shared checkout state, so one instance admits one writer at a
//! time. Callers that need concurrency serialize externally or hold one
//! instance per working tree.
//!
//! [`store`]: StorageBackend::store
//! [`retrieve`]: StorageBackend::retrieve
//! [`describe`]: StorageBackend::describe
//! [`create_from_reference`]: StorageBackend::create_from_reference
//! [`list_references`]: StorageBackend::list_references

pub mod branch;
pub mod changelist;
pub mod disk;
pub mod memory;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::metadata::{AssetMetadata, MetadataMap};

/// The kind of pre-existing content a [`StorageReference`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceType {
    /// A plain file on disk.
    File,
    /// A commit in a version-control repository.
    Commit,
    /// A submitted changelist.
    Changelist,
    /// A generic point-in-time reference.
    Snapshot,
}

impl ReferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceType::File => "file",
            ReferenceType::Commit => "commit",
            ReferenceType::Changelist => "changelist",
            ReferenceType::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pointer to content that already exists inside a backend, used to
/// create a tracked version without re-uploading bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageReference {
    /// Tag of the backend holding the content.
    pub storage_type: String,
    /// Backend-local identifier of the content.
    pub storage_id: String,
    /// Path of the content inside the backend's namespace.
    pub path: PathBuf,
    /// What kind of thing the reference points at.
    pub reference_type: ReferenceType,
    /// Backend-specific detail (sizes, authors, submit times, ...).
    #[serde(default)]
    pub metadata: MetadataMap,
}

/// One pluggable storage technology.
///
/// Implementations must uphold the shared contract: `retrieve` and
/// `describe` fail with `NotFound` for unknown ids and never return
/// partial data; `list_references` returns an empty sequence — not an
/// error — when nothing matches; `create_from_reference` fails with
/// `UnsupportedReference` for reference types the backend does not accept.
pub trait StorageBackend {
    /// Tag identifying the storage technology (`"disk"`, `"branch"`, ...).
    /// Used as the `storage_type` of everything this backend emits.
    fn storage_type(&self) -> &'static str;

    /// Persists the file's bytes together with a copy of `metadata` and
    /// returns the new backend-local storage id. Calling this repeatedly
    /// is safe; each call yields a distinct id unless content and
    /// timestamp collide at the backend's resolution.
    fn store(&mut self, file: &Path, metadata: &AssetMetadata) -> Result<String>;

    /// Returns the stored bytes at `target` when one is given, otherwise
    /// at a backend-owned read-only path.
    fn retrieve(&mut self, storage_id: &str, target: Option<&Path>) -> Result<PathBuf>;

    /// Returns the metadata recorded at store time, augmented with the
    /// backend's injected keys (at minimum `original_path` and
    /// `timestamp`).
    fn describe(&mut self, storage_id: &str) -> Result<MetadataMap>;

    /// Promotes pre-existing content into a tracked version, without
    /// re-copying bytes where the technology allows it.
    fn create_from_reference(
        &mut self,
        reference: &StorageReference,
        metadata: &AssetMetadata,
    ) -> Result<String>;

    /// Enumerates existing content, optionally narrowed to one reference
    /// type and to paths containing `path_pattern` as a substring.
    fn list_references(
        &mut self,
        reference_type: Option<ReferenceType>,
        path_pattern: Option<&str>,
    ) -> Result<Vec<StorageReference>>;
}

/// An ordered collection of named backends.
///
/// Iteration order is insertion order, which is the fan-out order the
/// orchestrator uses when no explicit subset is given. Lookups are linear;
/// a configuration holds a handful of backends, not thousands.
#[derive(Default)]
pub struct BackendSet {
    entries: Vec<(String, Box<dyn StorageBackend>)>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Adds a backend under `name`, replacing any previous backend with
    /// the same name in place.
    pub fn insert(&mut self, name: impl Into<String>, backend: Box<dyn StorageBackend>) {
        let name = name.into();
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = backend;
        } else {
            self.entries.push((name, backend));
        }
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, backend: Box<dyn StorageBackend>) -> Self {
        self.insert(name, backend);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut (dyn StorageBackend + 'static)> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b.as_mut())
    }

    /// Backend names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = (&str, &mut (dyn StorageBackend + 'static))> {
        self.entries
            .iter_mut()
            .map(|(n, b)| (n.as_str(), b.as_mut()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(n, b)| (n, b.storage_type())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;

    #[test]
    fn reference_type_serializes_lowercase() {
        let json = serde_json::to_string(&ReferenceType::Changelist).unwrap();
        assert_eq!(json, "\"changelist\"");
        let back: ReferenceType = serde_json::from_str("\"file\"").unwrap();
        assert_eq!(back, ReferenceType::File);
    }

    #[test]
    fn backend_set_preserves_insertion_order() {
        let mut set = BackendSet::new();
        set.insert("zeta", Box::new(MemoryStore::new()));
        set.insert("alpha", Box::new(MemoryStore::new()));
        set.insert("mid", Box::new(MemoryStore::new()));

        let names: Vec<_> = set.names().collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn backend_set_insert_replaces_in_place() {
        let mut set = BackendSet::new();
        set.insert("a", Box::new(MemoryStore::new()));
        set.insert("b", Box::new(MemoryStore::new()));
        set.insert("a", Box::new(MemoryStore::new()));

        assert_eq!(set.len(), 2);
        let names: Vec<_> = set.names().collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
