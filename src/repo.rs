//! The canonical cross-backend version index.
//!
//! The repository answers one question the backends cannot: "what logical
//! versions exist for this file, and where do their bytes live?" Each
//! created version gets a repository-assigned integer id, and one
//! storage-location row per backend that actually succeeded in storing it
//! — never one for a backend that failed, which makes the location list a
//! strict subset of the backends requested at creation time.
//!
//! The core depends only on the narrow [`VersionRepository`] contract;
//! [`sqlite::SqliteRepository`] is the bundled implementation, but nothing
//! above this module cares which engine sits underneath.

pub mod sqlite;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::metadata::{AssetMetadata, MetadataMap};

/// One logical version as the repository records it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionRecord {
    /// Repository-assigned, globally unique id.
    pub id: i64,
    pub file_path: String,
    pub creator: String,
    pub tool_version: String,
    pub description: Option<String>,
    /// Repository-assigned creation instant.
    pub created_at: DateTime<Utc>,
    pub custom_data: MetadataMap,
    /// Tag set; duplicates collapse on write.
    pub tags: Vec<String>,
}

/// One backend that successfully stored a version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageLocation {
    pub storage_type: String,
    pub storage_id: String,
    pub created_at: DateTime<Utc>,
}

/// Filter for [`VersionRepository::find_versions`]. Absent fields match
/// everything.
#[derive(Debug, Clone, Default)]
pub struct VersionQuery {
    pub file_path: Option<PathBuf>,
    /// Versions carrying *all* of these tags.
    pub tags: Option<Vec<String>>,
    pub creator: Option<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

impl VersionQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = Some(creator.into());
        self
    }

    pub fn with_after(mut self, after: DateTime<Utc>) -> Self {
        self.after = Some(after);
        self
    }

    pub fn with_before(mut self, before: DateTime<Utc>) -> Self {
        self.before = Some(before);
        self
    }
}

/// The narrow contract the orchestrator consumes.
///
/// `metadata` carries exactly the contract's creator / tool_version /
/// description / tags / custom_data fields; the repository assigns the id
/// and the creation instant itself.
pub trait VersionRepository {
    /// Creates a new version entry and returns its id.
    fn create_version(&self, file_path: &Path, metadata: &AssetMetadata) -> Result<i64>;

    /// Records that `storage_type` holds this version under `storage_id`.
    fn add_storage_location(
        &self,
        version_id: i64,
        storage_type: &str,
        storage_id: &str,
    ) -> Result<()>;

    /// Looks a version up by id.
    fn get_version_info(&self, version_id: i64) -> Result<VersionRecord>;

    /// All storage locations recorded for a version.
    fn get_storage_locations(&self, version_id: i64) -> Result<Vec<StorageLocation>>;

    /// Versions matching every present filter field.
    fn find_versions(&self, query: &VersionQuery) -> Result<Vec<VersionRecord>>;
}
