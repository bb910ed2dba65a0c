//! In-process storage backend for tests and simulations.
//!
//! Holds every version in a plain map and satisfies the full backend
//! contract, so orchestrator and reconciler behavior can be exercised
//! without touching disk-level machinery or external systems. Faults are
//! injectable per operation (store, enumerate), and store attempts are
//! counted, which lets sequencing tests assert that a backend after a
//! failure was never tried.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info_span, Span};

use crate::error::{Result, VaultError};
use crate::metadata::{AssetMetadata, MetadataMap};
use crate::storage::{ReferenceType, StorageBackend, StorageReference};

const STORAGE_TYPE: &str = "memory";

struct StoredVersion {
    content: Vec<u8>,
    metadata: MetadataMap,
    original_path: PathBuf,
}

/// Map-backed backend; versions are Snapshot references when enumerated.
pub struct MemoryStore {
    versions: BTreeMap<String, StoredVersion>,
    sequence: u64,
    scratch: Option<tempfile::TempDir>,
    fail_store: bool,
    fail_list: bool,
    store_attempts: usize,
    span: Span,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            versions: BTreeMap::new(),
            sequence: 0,
            scratch: None,
            fail_store: false,
            fail_list: false,
            store_attempts: 0,
            span: info_span!("memory_store"),
        }
    }

    /// Every subsequent `store` fails with a backend error.
    pub fn with_store_fault(mut self) -> Self {
        self.fail_store = true;
        self
    }

    /// Every subsequent `list_references` fails with a backend error.
    pub fn with_list_fault(mut self) -> Self {
        self.fail_list = true;
        self
    }

    /// How many times `store` has been attempted, failures included.
    pub fn store_attempts(&self) -> usize {
        self.store_attempts
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    fn next_id(&mut self, content: &[u8]) -> String {
        self.sequence += 1;
        format!(
            "{}_{:04}",
            hex::encode(blake3::hash(content).as_bytes()),
            self.sequence
        )
    }

    fn insert(
        &mut self,
        content: Vec<u8>,
        metadata: &AssetMetadata,
        original_path: &Path,
        extra: MetadataMap,
    ) -> String {
        let id = self.next_id(&content);
        let mut map = metadata.to_map();
        map.insert(
            "original_path".into(),
            original_path.display().to_string().into(),
        );
        map.insert(
            "timestamp".into(),
            Utc::now()
                .to_rfc3339_opts(SecondsFormat::Micros, true)
                .into(),
        );
        map.extend(extra);
        self.versions.insert(
            id.clone(),
            StoredVersion {
                content,
                metadata: map,
                original_path: original_path.to_path_buf(),
            },
        );
        id
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryStore {
    fn storage_type(&self) -> &'static str {
        STORAGE_TYPE
    }

    fn store(&mut self, file: &Path, metadata: &AssetMetadata) -> Result<String> {
        let _enter = self.span.clone().entered();
        self.store_attempts += 1;
        if self.fail_store {
            return Err(VaultError::backend(STORAGE_TYPE, "injected store fault"));
        }
        let content = fs::read(file).map_err(|e| {
            VaultError::backend_with(
                STORAGE_TYPE,
                format!("failed to read {}", file.display()),
                e,
            )
        })?;
        let id = self.insert(content, metadata, file, MetadataMap::new());
        debug!(id = %id, "stored version");
        Ok(id)
    }

    fn retrieve(&mut self, storage_id: &str, target: Option<&Path>) -> Result<PathBuf> {
        let _enter = self.span.enter();
        if !self.versions.contains_key(storage_id) {
            return Err(VaultError::not_found(STORAGE_TYPE, storage_id));
        }

        let destination = match target {
            Some(target) => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| {
                        VaultError::backend_with(
                            STORAGE_TYPE,
                            "failed to create target directory",
                            e,
                        )
                    })?;
                }
                target.to_path_buf()
            }
            None => {
                if self.scratch.is_none() {
                    self.scratch = Some(tempfile::tempdir().map_err(|e| {
                        VaultError::backend_with(STORAGE_TYPE, "failed to create scratch dir", e)
                    })?);
                }
                self.scratch
                    .as_ref()
                    .expect("scratch dir was just created")
                    .path()
                    .join(storage_id)
            }
        };
        let version = self
            .versions
            .get(storage_id)
            .expect("version presence was checked");
        fs::write(&destination, &version.content)
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to write content", e))?;
        Ok(destination)
    }

    fn describe(&mut self, storage_id: &str) -> Result<MetadataMap> {
        let _enter = self.span.enter();
        self.versions
            .get(storage_id)
            .map(|v| v.metadata.clone())
            .ok_or_else(|| VaultError::not_found(STORAGE_TYPE, storage_id))
    }

    fn create_from_reference(
        &mut self,
        reference: &StorageReference,
        metadata: &AssetMetadata,
    ) -> Result<String> {
        let _enter = self.span.clone().entered();
        let mut extra = MetadataMap::new();
        extra.insert(
            "reference".into(),
            serde_json::to_value(reference).map_err(|e| {
                VaultError::backend_with(STORAGE_TYPE, "failed to encode reference", e)
            })?,
        );

        match reference.reference_type {
            ReferenceType::File => {
                let content = fs::read(&reference.path).map_err(|e| {
                    VaultError::backend_with(
                        STORAGE_TYPE,
                        format!("referenced file not found: {}", reference.path.display()),
                        e,
                    )
                })?;
                Ok(self.insert(content, metadata, &reference.path, extra))
            }
            // A snapshot points at a version this store already holds.
            ReferenceType::Snapshot => {
                let (content, original_path) = self
                    .versions
                    .get(&reference.storage_id)
                    .map(|v| (v.content.clone(), v.original_path.clone()))
                    .ok_or_else(|| {
                        VaultError::not_found(STORAGE_TYPE, &reference.storage_id)
                    })?;
                Ok(self.insert(content, metadata, &original_path, extra))
            }
            other => Err(VaultError::unsupported_reference(STORAGE_TYPE, other)),
        }
    }

    fn list_references(
        &mut self,
        reference_type: Option<ReferenceType>,
        path_pattern: Option<&str>,
    ) -> Result<Vec<StorageReference>> {
        let _enter = self.span.enter();
        if self.fail_list {
            return Err(VaultError::backend(STORAGE_TYPE, "injected list fault"));
        }
        if reference_type.is_some_and(|t| t != ReferenceType::Snapshot) {
            return Ok(Vec::new());
        }

        let mut refs = Vec::new();
        for (id, version) in &self.versions {
            let path = version.original_path.display().to_string();
            if path_pattern.is_some_and(|p| !path.contains(p)) {
                continue;
            }
            let mut detail = MetadataMap::new();
            detail.insert("size".into(), (version.content.len() as u64).into());
            detail.insert("action".into(), "store".into());
            if let Some(timestamp) = version.metadata.get("timestamp") {
                detail.insert("timestamp".into(), timestamp.clone());
            }
            refs.push(StorageReference {
                storage_type: STORAGE_TYPE.to_string(),
                storage_id: id.clone(),
                path: version.original_path.clone(),
                reference_type: ReferenceType::Snapshot,
                metadata: detail,
            });
        }
        Ok(refs)
    }
}
