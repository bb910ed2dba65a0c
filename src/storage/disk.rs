//! Content-addressed disk storage.
//!
//! Every stored version gets an id of the form
//! `<blake3 hex of content>_<RFC 3339 UTC timestamp>`. Content lives under
//! a two-level bucket tree derived from the first four hex characters of
//! the id, which bounds directory fan-out:
//!
//! ```text
//! <root>/ab/cd/abcd…_2026-08-06T12:34:56.123456Z      content
//! <root>/_metadata/abcd…_2026-08-06T12:34:56.123456Z.json   sidecar
//! ```
//!
//! A version is observable only once its sidecar exists. Both content and
//! sidecar are staged to a `.tmp` neighbor and renamed into place, content
//! strictly first — an interrupted store leaves at worst an orphaned
//! content file and a `.tmp`, never a readable half-version.
//!
//! The tree is safe for concurrent readers and for writers producing
//! distinct content. Two writers storing identical bytes inside the same
//! microsecond collide to the same id and restage the same data; callers
//! needing write-write isolation serialize externally.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info_span, Span};

use crate::error::{Result, VaultError};
use crate::metadata::{AssetMetadata, MetadataMap};
use crate::storage::{ReferenceType, StorageBackend, StorageReference};

const STORAGE_TYPE: &str = "disk";
const METADATA_DIR: &str = "_metadata";
const STAGING_SUFFIX: &str = "tmp";

/// Content-addressed store over a plain directory tree.
pub struct DiskStore {
    root: PathBuf,
    metadata_root: PathBuf,
    span: Span,
}

impl DiskStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let metadata_root = root.join(METADATA_DIR);
        fs::create_dir_all(&metadata_root)
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to create store root", e))?;
        let span = info_span!("disk_store", root = %root.display());
        Ok(Self {
            root,
            metadata_root,
            span,
        })
    }

    fn version_id(content: &[u8], timestamp: DateTime<Utc>) -> String {
        let hash = blake3::hash(content);
        format!(
            "{}_{}",
            hex::encode(hash.as_bytes()),
            timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
        )
    }

    fn content_path(&self, storage_id: &str) -> PathBuf {
        // Ids shorter than the bucket prefix cannot have been issued by us;
        // route them to a path that simply won't exist.
        if storage_id.len() < 4 || !storage_id.is_ascii() {
            return self.root.join(storage_id);
        }
        self.root
            .join(&storage_id[0..2])
            .join(&storage_id[2..4])
            .join(storage_id)
    }

    fn sidecar_path(&self, storage_id: &str) -> PathBuf {
        self.metadata_root.join(format!("{storage_id}.json"))
    }

    /// Stages `bytes` next to `target` and renames them into place.
    fn place(target: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                VaultError::backend_with(STORAGE_TYPE, "failed to create bucket directory", e)
            })?;
        }
        // Ids embed dots (the timestamp), so append rather than replace
        // the extension.
        let mut staged_name = target.file_name().unwrap_or_default().to_os_string();
        staged_name.push(".");
        staged_name.push(STAGING_SUFFIX);
        let staged = target.with_file_name(staged_name);
        fs::write(&staged, bytes)
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to stage file", e))?;
        fs::rename(&staged, target)
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to finalize file", e))?;
        Ok(())
    }

    /// Writes the sidecar for `storage_id`. Must only be called after the
    /// content file is durably in place.
    fn write_sidecar(&self, storage_id: &str, map: &MetadataMap) -> Result<()> {
        let json = serde_json::to_vec_pretty(map)
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to encode sidecar", e))?;
        Self::place(&self.sidecar_path(storage_id), &json)
    }

    fn injected_map(
        metadata: &AssetMetadata,
        original_path: &Path,
        timestamp: DateTime<Utc>,
    ) -> MetadataMap {
        let mut map = metadata.to_map();
        map.insert(
            "original_path".into(),
            original_path.display().to_string().into(),
        );
        map.insert(
            "timestamp".into(),
            timestamp
                .to_rfc3339_opts(SecondsFormat::Micros, true)
                .into(),
        );
        map
    }

    fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                Self::walk_files(&path, out)?;
            } else {
                out.push(path);
            }
        }
        Ok(())
    }
}

impl StorageBackend for DiskStore {
    fn storage_type(&self) -> &'static str {
        STORAGE_TYPE
    }

    fn store(&mut self, file: &Path, metadata: &AssetMetadata) -> Result<String> {
        let _enter = self.span.enter();
        let content = fs::read(file).map_err(|e| {
            VaultError::backend_with(
                STORAGE_TYPE,
                format!("failed to read {}", file.display()),
                e,
            )
        })?;

        let timestamp = Utc::now();
        let storage_id = Self::version_id(&content, timestamp);

        Self::place(&self.content_path(&storage_id), &content)?;
        self.write_sidecar(&storage_id, &Self::injected_map(metadata, file, timestamp))?;

        debug!(id = %storage_id, bytes = content.len(), "stored version");
        Ok(storage_id)
    }

    fn retrieve(&mut self, storage_id: &str, target: Option<&Path>) -> Result<PathBuf> {
        let _enter = self.span.enter();
        let content_path = self.content_path(storage_id);
        if !content_path.is_file() {
            return Err(VaultError::not_found(STORAGE_TYPE, storage_id));
        }

        let Some(target) = target else {
            return Ok(content_path);
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                VaultError::backend_with(STORAGE_TYPE, "failed to create target directory", e)
            })?;
        }
        fs::copy(&content_path, target).map_err(|e| {
            VaultError::backend_with(
                STORAGE_TYPE,
                format!("failed to copy to {}", target.display()),
                e,
            )
        })?;
        Ok(target.to_path_buf())
    }

    fn describe(&mut self, storage_id: &str) -> Result<MetadataMap> {
        let _enter = self.span.enter();
        let sidecar = self.sidecar_path(storage_id);
        if !sidecar.is_file() {
            return Err(VaultError::not_found(STORAGE_TYPE, storage_id));
        }
        let bytes = fs::read(&sidecar)
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to read sidecar", e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "malformed sidecar", e))
    }

    fn create_from_reference(
        &mut self,
        reference: &StorageReference,
        metadata: &AssetMetadata,
    ) -> Result<String> {
        let _enter = self.span.enter();
        if reference.reference_type != ReferenceType::File {
            return Err(VaultError::unsupported_reference(
                STORAGE_TYPE,
                reference.reference_type,
            ));
        }
        if !reference.path.is_file() {
            return Err(VaultError::backend(
                STORAGE_TYPE,
                format!("referenced file not found: {}", reference.path.display()),
            ));
        }

        let timestamp = Utc::now();
        let storage_id = if reference.storage_id.is_empty() {
            let content = fs::read(&reference.path).map_err(|e| {
                VaultError::backend_with(STORAGE_TYPE, "failed to read referenced file", e)
            })?;
            Self::version_id(&content, timestamp)
        } else {
            reference.storage_id.clone()
        };

        let content_path = self.content_path(&storage_id);
        if !content_path.exists() && content_path != reference.path {
            if let Some(parent) = content_path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    VaultError::backend_with(STORAGE_TYPE, "failed to create bucket directory", e)
                })?;
            }
            // Hard link when possible; a cross-filesystem reference falls
            // back to a byte copy.
            if fs::hard_link(&reference.path, &content_path).is_err() {
                fs::copy(&reference.path, &content_path).map_err(|e| {
                    VaultError::backend_with(STORAGE_TYPE, "failed to copy referenced file", e)
                })?;
            }
        }

        let mut map = Self::injected_map(metadata, &reference.path, timestamp);
        map.insert(
            "reference".into(),
            serde_json::to_value(reference).map_err(|e| {
                VaultError::backend_with(STORAGE_TYPE, "failed to encode reference", e)
            })?,
        );
        self.write_sidecar(&storage_id, &map)?;

        debug!(id = %storage_id, "created version from reference");
        Ok(storage_id)
    }

    fn list_references(
        &mut self,
        reference_type: Option<ReferenceType>,
        path_pattern: Option<&str>,
    ) -> Result<Vec<StorageReference>> {
        let _enter = self.span.enter();
        if reference_type.is_some_and(|t| t != ReferenceType::File) {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(&self.root)
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to read store root", e))?
        {
            let entry = entry.map_err(|e| {
                VaultError::backend_with(STORAGE_TYPE, "failed to read store root", e)
            })?;
            // Sidecars are bookkeeping, not content.
            if entry.file_name() == METADATA_DIR {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                Self::walk_files(&path, &mut files).map_err(|e| {
                    VaultError::backend_with(STORAGE_TYPE, "failed to walk store", e)
                })?;
            } else {
                files.push(path);
            }
        }

        let mut refs = Vec::new();
        for path in files {
            if path.extension().is_some_and(|e| e == STAGING_SUFFIX) {
                continue;
            }
            if let Some(pattern) = path_pattern {
                if !path.display().to_string().contains(pattern) {
                    continue;
                }
            }

            // The bucket file is named by its full version id, which is
            // what describe wants back.
            let storage_id = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let meta = fs::metadata(&path).map_err(|e| {
                VaultError::backend_with(STORAGE_TYPE, "failed to stat stored file", e)
            })?;

            let mut detail = MetadataMap::new();
            detail.insert("size".into(), meta.len().into());
            if let Ok(modified) = meta.modified() {
                let modified: DateTime<Utc> = modified.into();
                detail.insert(
                    "modified".into(),
                    modified
                        .to_rfc3339_opts(SecondsFormat::Micros, true)
                        .into(),
                );
            }

            refs.push(StorageReference {
                storage_type: STORAGE_TYPE.to_string(),
                storage_id,
                path,
                reference_type: ReferenceType::File,
                metadata: detail,
            });
        }
        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_path_splits_leading_hex() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskStore::new(tmp.path()).unwrap();
        let path = store.content_path("abcdef_2026-01-01T00:00:00.000000Z");
        assert_eq!(
            path,
            tmp.path()
                .join("ab")
                .join("cd")
                .join("abcdef_2026-01-01T00:00:00.000000Z")
        );
    }

    #[test]
    fn short_ids_never_panic() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskStore::new(tmp.path()).unwrap();
        assert_eq!(store.content_path("ab"), tmp.path().join("ab"));
    }

    #[test]
    fn version_ids_hash_and_stamp() {
        let ts = Utc::now();
        let a = DiskStore::version_id(b"one", ts);
        let b = DiskStore::version_id(b"two", ts);
        assert_ne!(a, b);
        assert!(a.ends_with(&ts.to_rfc3339_opts(SecondsFormat::Micros, true)));
    }
}
