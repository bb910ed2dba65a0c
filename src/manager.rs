//! The multi-backend version-creation orchestrator.
//!
//! [`VersionManager`] owns a [`BackendSet`] and, optionally, a
//! [`VersionRepository`]. Creating a version is a strictly ordered,
//! strictly sequential pass:
//!
//! 1. The repository entry is created first. If that fails nothing else is
//!    attempted and the error surfaces.
//! 2. Each selected backend stores the file, in caller-supplied order. A
//!    store failure surfaces immediately: backends not yet reached are
//!    never tried, and backends already written are *not* rolled back.
//!    Callers must read a raised error as "some backends may already hold
//!    this version".
//! 3. After each successful store, the backend's storage location is
//!    registered against the repository entry. A registration failure is
//!    logged and the pass continues — the repository missing a location
//!    the backend actually has is an accepted inconsistency.
//!
//! There is no cross-backend transaction and none is pretended; the
//! contract is "all the backends that didn't fail".

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Span};

use crate::error::{Result, VaultError};
use crate::history::{HistoryReconciler, HistoryReport};
use crate::metadata::AssetMetadata;
use crate::repo::{VersionQuery, VersionRecord, VersionRepository};
use crate::storage::{BackendSet, StorageReference};

/// What one backend handed back for one logical version. Created once per
/// (backend, version), never mutated; owned by the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionIdentifier {
    /// Name the backend is configured under.
    pub storage_type: String,
    /// Backend-local id; meaningless in any other backend.
    pub storage_id: String,
    /// The source file the version was created from.
    pub file_path: PathBuf,
    /// When the orchestrator created this identifier.
    pub timestamp: DateTime<Utc>,
    /// Copy of the metadata the version was stored with.
    pub metadata: AssetMetadata,
}

/// Orchestrates version creation across backends and the repository index.
pub struct VersionManager {
    backends: BackendSet,
    repository: Option<Box<dyn VersionRepository>>,
    span: Span,
}

impl VersionManager {
    pub fn new(backends: BackendSet) -> Self {
        Self {
            backends,
            repository: None,
            span: info_span!("version_manager"),
        }
    }

    /// Attaches the canonical version index.
    pub fn with_repository(mut self, repository: Box<dyn VersionRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// The attached repository, if any.
    pub fn repository(&self) -> Option<&dyn VersionRepository> {
        self.repository.as_deref()
    }

    /// A reconciler borrowing this manager's backends.
    pub fn history(&mut self) -> HistoryReconciler<'_> {
        HistoryReconciler::new(&mut self.backends)
    }

    /// Resolves the fan-out order: the explicit subset when given (in the
    /// caller's order), otherwise every configured backend in
    /// configuration order. Unknown names fail before anything is written.
    fn fan_out_order(&self, subset: Option<&[&str]>) -> Result<Vec<String>> {
        match subset {
            Some(names) => names
                .iter()
                .map(|name| {
                    if self.backends.contains(name) {
                        Ok(name.to_string())
                    } else {
                        Err(VaultError::config(format!("unknown backend '{name}'")))
                    }
                })
                .collect(),
            None => Ok(self.backends.names().map(str::to_string).collect()),
        }
    }

    /// Creates a logical version across the selected backends.
    ///
    /// Returns one [`VersionIdentifier`] per backend that completed its
    /// store. See the module docs for the exact failure policy.
    pub fn create_version(
        &mut self,
        file: &Path,
        metadata: &AssetMetadata,
        subset: Option<&[&str]>,
    ) -> Result<BTreeMap<String, VersionIdentifier>> {
        let _enter = self.span.enter();
        let order = self.fan_out_order(subset)?;
        info!(path = %file.display(), backends = order.len(), "creating version");

        let repository_version = match &self.repository {
            Some(repository) => Some(repository.create_version(file, metadata)?),
            None => None,
        };

        let mut identifiers = BTreeMap::new();
        for name in order {
            let backend = self
                .backends
                .get_mut(&name)
                .expect("fan-out order only contains configured backends");
            let storage_id = backend.store(file, metadata)?;

            if let (Some(version_id), Some(repository)) =
                (repository_version, self.repository.as_deref())
            {
                if let Err(e) = repository.add_storage_location(version_id, &name, &storage_id) {
                    // Accepted inconsistency: the backend holds the bytes,
                    // the index does not know. Keep going.
                    error!(backend = %name, version_id, error = %e,
                           "failed to register storage location");
                }
            }

            identifiers.insert(
                name.clone(),
                VersionIdentifier {
                    storage_type: name,
                    storage_id,
                    file_path: file.to_path_buf(),
                    timestamp: Utc::now(),
                    metadata: metadata.clone(),
                },
            );
        }
        Ok(identifiers)
    }

    /// Promotes pre-existing backend content into a tracked version, with
    /// the same repository-first / non-fatal-registration policy as
    /// [`create_version`](Self::create_version), for a single backend.
    pub fn create_version_from_reference(
        &mut self,
        backend_name: &str,
        reference: &StorageReference,
        metadata: &AssetMetadata,
    ) -> Result<VersionIdentifier> {
        let _enter = self.span.enter();
        if !self.backends.contains(backend_name) {
            return Err(VaultError::config(format!(
                "unknown backend '{backend_name}'"
            )));
        }

        let repository_version = match &self.repository {
            Some(repository) => Some(repository.create_version(&reference.path, metadata)?),
            None => None,
        };

        let backend = self
            .backends
            .get_mut(backend_name)
            .expect("backend presence was checked");
        let storage_id = backend.create_from_reference(reference, metadata)?;

        if let (Some(version_id), Some(repository)) =
            (repository_version, self.repository.as_deref())
        {
            if let Err(e) = repository.add_storage_location(version_id, backend_name, &storage_id)
            {
                error!(backend = %backend_name, version_id, error = %e,
                       "failed to register storage location");
            }
        }

        Ok(VersionIdentifier {
            storage_type: backend_name.to_string(),
            storage_id,
            file_path: reference.path.clone(),
            timestamp: Utc::now(),
            metadata: metadata.clone(),
        })
    }

    /// Pass-through retrieve on one backend. An unknown backend name is a
    /// configuration error, which is not the same thing as an unknown id.
    pub fn retrieve(
        &mut self,
        backend_name: &str,
        storage_id: &str,
        target: Option<&Path>,
    ) -> Result<PathBuf> {
        let _enter = self.span.enter();
        let backend = self
            .backends
            .get_mut(backend_name)
            .ok_or_else(|| VaultError::config(format!("unknown backend '{backend_name}'")))?;
        backend.retrieve(storage_id, target)
    }

    /// Pass-through describe on one backend, folded back into an
    /// [`AssetMetadata`] record.
    pub fn describe(&mut self, backend_name: &str, storage_id: &str) -> Result<AssetMetadata> {
        let _enter = self.span.enter();
        let backend = self
            .backends
            .get_mut(backend_name)
            .ok_or_else(|| VaultError::config(format!("unknown backend '{backend_name}'")))?;
        let map = backend.describe(storage_id)?;
        AssetMetadata::from_map(&map).map_err(|e| {
            VaultError::backend_with(backend_name, "metadata record is not an asset record", e)
        })
    }

    /// Repository query; a configuration error when no repository is
    /// attached.
    pub fn find_versions(&self, query: &VersionQuery) -> Result<Vec<VersionRecord>> {
        let _enter = self.span.enter();
        let repository = self
            .repository
            .as_deref()
            .ok_or_else(|| VaultError::config("no version repository attached"))?;
        repository.find_versions(query)
    }

    /// Dumps the full history of an asset: the reconciler report plus,
    /// when a repository is attached, its view of the asset's versions.
    /// A repository failure is recorded in the report, not raised.
    pub fn dump_asset_history(
        &mut self,
        file_path: &Path,
        include_storage_data: bool,
        include_timeline: bool,
    ) -> HistoryReport {
        let _enter = self.span.enter();
        let mut report = HistoryReconciler::new(&mut self.backends).dump_history(
            file_path,
            include_storage_data,
            include_timeline,
        );

        let Some(repository) = self.repository.as_deref() else {
            return report;
        };

        match repository.find_versions(&VersionQuery::for_path(file_path)) {
            Ok(versions) => {
                report.repository_latest_version = versions.last().map(|v| v.id);
                report.repository_total_versions = Some(versions.len());

                let mut entries = Vec::new();
                for version in versions {
                    let storage_locations = if include_storage_data {
                        match repository.get_storage_locations(version.id) {
                            Ok(locations) => Some(locations),
                            Err(e) => {
                                warn!(version_id = version.id, error = %e,
                                      "failed to load storage locations");
                                None
                            }
                        }
                    } else {
                        None
                    };
                    entries.push(crate::history::RepositoryVersionEntry {
                        version,
                        storage_locations,
                    });
                }
                report.repository_versions = Some(entries);
            }
            Err(e) => {
                error!(path = %file_path.display(), error = %e, "repository history query failed");
                report.repository_error = Some(e.to_string());
            }
        }
        report
    }
}
