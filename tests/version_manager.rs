use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};

use assetvault::error::{Result, VaultError};
use assetvault::metadata::{AssetMetadata, MetadataMap};
use assetvault::repo::sqlite::SqliteRepository;
use assetvault::repo::{StorageLocation, VersionQuery, VersionRecord, VersionRepository};
use assetvault::storage::branch::BranchStore;
use assetvault::storage::disk::DiskStore;
use assetvault::storage::memory::MemoryStore;
use assetvault::storage::{BackendSet, ReferenceType, StorageReference};
use assetvault::VersionManager;

fn write_asset(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

fn sample_metadata() -> AssetMetadata {
    AssetMetadata::new("jane", "maya-2026")
        .with_description("hero pass")
        .with_tags(["character"])
}

/// Repository whose create always fails.
struct FailingRepo;

impl VersionRepository for FailingRepo {
    fn create_version(&self, _: &Path, _: &AssetMetadata) -> Result<i64> {
        Err(VaultError::repository("index offline"))
    }
    fn add_storage_location(&self, _: i64, _: &str, _: &str) -> Result<()> {
        Ok(())
    }
    fn get_version_info(&self, id: i64) -> Result<VersionRecord> {
        Err(VaultError::not_found("repository", id.to_string()))
    }
    fn get_storage_locations(&self, _: i64) -> Result<Vec<StorageLocation>> {
        Ok(Vec::new())
    }
    fn find_versions(&self, _: &VersionQuery) -> Result<Vec<VersionRecord>> {
        Err(VaultError::repository("index offline"))
    }
}

/// Repository that accepts versions but rejects location registration.
struct RejectingLocations {
    created: RefCell<u32>,
}

impl RejectingLocations {
    fn new() -> Self {
        Self {
            created: RefCell::new(0),
        }
    }
}

impl VersionRepository for RejectingLocations {
    fn create_version(&self, _: &Path, _: &AssetMetadata) -> Result<i64> {
        *self.created.borrow_mut() += 1;
        Ok(i64::from(*self.created.borrow()))
    }
    fn add_storage_location(&self, _: i64, _: &str, _: &str) -> Result<()> {
        Err(VaultError::repository("location table locked"))
    }
    fn get_version_info(&self, id: i64) -> Result<VersionRecord> {
        Err(VaultError::not_found("repository", id.to_string()))
    }
    fn get_storage_locations(&self, _: i64) -> Result<Vec<StorageLocation>> {
        Ok(Vec::new())
    }
    fn find_versions(&self, _: &VersionQuery) -> Result<Vec<VersionRecord>> {
        Ok(Vec::new())
    }
}

#[test]
fn create_version_fans_out_and_indexes_every_success() {
    let tmp = tempfile::tempdir().unwrap();
    let asset = write_asset(tmp.path(), "hero.png", b"v1");

    let backends = BackendSet::new()
        .with("primary", Box::new(MemoryStore::new()))
        .with("mirror", Box::new(MemoryStore::new()));
    let mut manager = VersionManager::new(backends)
        .with_repository(Box::new(SqliteRepository::in_memory().unwrap()));

    let identifiers = manager
        .create_version(&asset, &sample_metadata(), None)
        .unwrap();
    assert_eq!(identifiers.len(), 2);
    assert_eq!(identifiers["primary"].storage_type, "primary");
    assert_eq!(identifiers["primary"].file_path, asset);
    assert_eq!(identifiers["primary"].metadata.creator, "jane");

    let repo = manager.repository().unwrap();
    let versions = repo.find_versions(&VersionQuery::for_path(&asset)).unwrap();
    assert_eq!(versions.len(), 1);

    let locations = repo.get_storage_locations(versions[0].id).unwrap();
    assert_eq!(locations.len(), 2);
    let types: Vec<_> = locations.iter().map(|l| l.storage_type.as_str()).collect();
    assert_eq!(types, vec!["primary", "mirror"]);
}

#[test]
fn disk_and_branch_backends_share_one_repository_version() {
    let tmp = tempfile::tempdir().unwrap();
    let asset = write_asset(tmp.path(), "hero.png", b"v1");

    let backends = BackendSet::new()
        .with(
            "disk",
            Box::new(DiskStore::new(tmp.path().join("store")).unwrap()),
        )
        .with(
            "branch",
            Box::new(BranchStore::new(tmp.path().join("repo")).unwrap()),
        );
    let mut manager = VersionManager::new(backends)
        .with_repository(Box::new(SqliteRepository::in_memory().unwrap()));

    let identifiers = manager
        .create_version(&asset, &sample_metadata(), None)
        .unwrap();
    assert_eq!(identifiers.len(), 2);

    let repo = manager.repository().unwrap();
    let versions = repo.find_versions(&VersionQuery::for_path(&asset)).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(repo.get_storage_locations(versions[0].id).unwrap().len(), 2);
}

#[test]
fn store_failure_stops_the_fan_out_without_rollback() {
    let tmp = tempfile::tempdir().unwrap();
    let asset = write_asset(tmp.path(), "hero.png", b"v1");

    let backends = BackendSet::new()
        .with("a_first", Box::new(MemoryStore::new()))
        .with("b_broken", Box::new(MemoryStore::new().with_store_fault()))
        .with("c_last", Box::new(MemoryStore::new()));
    let mut manager = VersionManager::new(backends)
        .with_repository(Box::new(SqliteRepository::in_memory().unwrap()));

    let err = manager
        .create_version(&asset, &sample_metadata(), None)
        .unwrap_err();
    assert!(matches!(err, VaultError::Backend { .. }));

    // The first backend keeps its write, the one after the failure was
    // never attempted.
    let references = manager.history().collect_references(None);
    assert_eq!(references["a_first"].len(), 1);
    assert_eq!(references["b_broken"].len(), 0);
    assert_eq!(references["c_last"].len(), 0);

    // The repository entry exists and lists exactly the one success.
    let repo = manager.repository().unwrap();
    let versions = repo.find_versions(&VersionQuery::for_path(&asset)).unwrap();
    assert_eq!(versions.len(), 1);
    let locations = repo.get_storage_locations(versions[0].id).unwrap();
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].storage_type, "a_first");
}

#[test]
fn repository_create_failure_prevents_all_backend_writes() {
    let tmp = tempfile::tempdir().unwrap();
    let asset = write_asset(tmp.path(), "hero.png", b"v1");

    let backends = BackendSet::new().with("only", Box::new(MemoryStore::new()));
    let mut manager = VersionManager::new(backends).with_repository(Box::new(FailingRepo));

    let err = manager
        .create_version(&asset, &sample_metadata(), None)
        .unwrap_err();
    assert!(matches!(err, VaultError::Repository { .. }));

    let references = manager.history().collect_references(None);
    assert!(references["only"].is_empty());
}

#[test]
fn location_registration_failure_is_non_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let asset = write_asset(tmp.path(), "hero.png", b"v1");

    let backends = BackendSet::new()
        .with("a", Box::new(MemoryStore::new()))
        .with("b", Box::new(MemoryStore::new()));
    let mut manager =
        VersionManager::new(backends).with_repository(Box::new(RejectingLocations::new()));

    let identifiers = manager
        .create_version(&asset, &sample_metadata(), None)
        .unwrap();
    assert_eq!(identifiers.len(), 2);
}

#[test]
fn unknown_subset_names_fail_before_anything_is_written() {
    let tmp = tempfile::tempdir().unwrap();
    let asset = write_asset(tmp.path(), "hero.png", b"v1");

    let backends = BackendSet::new().with("real", Box::new(MemoryStore::new()));
    let repo = RejectingLocations::new();
    let mut manager = VersionManager::new(backends).with_repository(Box::new(repo));

    let err = manager
        .create_version(&asset, &sample_metadata(), Some(&["real", "imaginary"]))
        .unwrap_err();
    assert!(matches!(err, VaultError::Config { .. }));

    // Nothing reached the backend.
    let references = manager.history().collect_references(None);
    assert!(references["real"].is_empty());
}

#[test]
fn subset_restricts_the_fan_out() {
    let tmp = tempfile::tempdir().unwrap();
    let asset = write_asset(tmp.path(), "hero.png", b"v1");

    let backends = BackendSet::new()
        .with("a", Box::new(MemoryStore::new()))
        .with("b", Box::new(MemoryStore::new()));
    let mut manager = VersionManager::new(backends);

    let identifiers = manager
        .create_version(&asset, &sample_metadata(), Some(&["b"]))
        .unwrap();
    assert_eq!(identifiers.len(), 1);
    assert!(identifiers.contains_key("b"));

    let references = manager.history().collect_references(None);
    assert!(references["a"].is_empty());
    assert_eq!(references["b"].len(), 1);
}

#[test]
fn retrieve_and_describe_pass_through_by_backend_name() {
    let tmp = tempfile::tempdir().unwrap();
    let asset = write_asset(tmp.path(), "hero.png", b"payload");

    let backends = BackendSet::new().with("mem", Box::new(MemoryStore::new()));
    let mut manager = VersionManager::new(backends);
    let identifiers = manager
        .create_version(&asset, &sample_metadata(), None)
        .unwrap();
    let storage_id = identifiers["mem"].storage_id.clone();

    let target = tmp.path().join("restored.png");
    manager.retrieve("mem", &storage_id, Some(&target)).unwrap();
    assert_eq!(fs::read(&target).unwrap(), b"payload");

    let described = manager.describe("mem", &storage_id).unwrap();
    assert_eq!(described.creator, "jane");
    assert_eq!(described.tool_version, "maya-2026");
    assert_eq!(described.tags, vec!["character"]);
}

#[test]
fn unknown_backend_names_are_configuration_errors() {
    let backends = BackendSet::new().with("mem", Box::new(MemoryStore::new()));
    let mut manager = VersionManager::new(backends);

    let err = manager.retrieve("tape", "id", None).unwrap_err();
    assert!(matches!(err, VaultError::Config { .. }));
    let err = manager.describe("tape", "id").unwrap_err();
    assert!(matches!(err, VaultError::Config { .. }));

    // Unknown id on a known backend is a different failure class.
    let err = manager.retrieve("mem", "missing", None).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn find_versions_requires_a_repository() {
    let backends = BackendSet::new().with("mem", Box::new(MemoryStore::new()));
    let manager = VersionManager::new(backends);

    let err = manager.find_versions(&VersionQuery::new()).unwrap_err();
    assert!(matches!(err, VaultError::Config { .. }));
}

#[test]
fn reference_promotion_goes_through_the_same_policy() {
    let tmp = tempfile::tempdir().unwrap();
    let asset = write_asset(tmp.path(), "hero.png", b"v1");

    let backends = BackendSet::new().with("mem", Box::new(MemoryStore::new()));
    let mut manager = VersionManager::new(backends)
        .with_repository(Box::new(SqliteRepository::in_memory().unwrap()));

    let identifiers = manager
        .create_version(&asset, &sample_metadata(), None)
        .unwrap();
    let reference = StorageReference {
        storage_type: "mem".into(),
        storage_id: identifiers["mem"].storage_id.clone(),
        path: asset.clone(),
        reference_type: ReferenceType::Snapshot,
        metadata: MetadataMap::new(),
    };

    let promoted = manager
        .create_version_from_reference("mem", &reference, &sample_metadata())
        .unwrap();
    assert_eq!(promoted.storage_type, "mem");
    assert_ne!(promoted.storage_id, reference.storage_id);

    // Both the original and the promoted version are indexed.
    let repo = manager.repository().unwrap();
    let versions = repo.find_versions(&VersionQuery::for_path(&asset)).unwrap();
    assert_eq!(versions.len(), 2);

    let err = manager
        .create_version_from_reference("tape", &reference, &sample_metadata())
        .unwrap_err();
    assert!(matches!(err, VaultError::Config { .. }));
}

#[test]
fn history_dump_includes_repository_view() {
    let tmp = tempfile::tempdir().unwrap();
    let asset = write_asset(tmp.path(), "hero.png", b"v1");

    let backends = BackendSet::new().with("mem", Box::new(MemoryStore::new()));
    let mut manager = VersionManager::new(backends)
        .with_repository(Box::new(SqliteRepository::in_memory().unwrap()));
    manager
        .create_version(&asset, &sample_metadata(), None)
        .unwrap();

    let report = manager.dump_asset_history(&asset, true, true);
    assert_eq!(report.asset_path, asset.display().to_string());
    assert_eq!(report.repository_total_versions, Some(1));
    let entries = report.repository_versions.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].version.creator, "jane");
    assert_eq!(entries[0].storage_locations.as_ref().unwrap().len(), 1);
}

#[test]
fn history_dump_records_repository_failure_instead_of_raising() {
    let tmp = tempfile::tempdir().unwrap();
    let asset = write_asset(tmp.path(), "hero.png", b"v1");

    let backends = BackendSet::new().with("mem", Box::new(MemoryStore::new()));
    let mut manager = VersionManager::new(backends).with_repository(Box::new(FailingRepo));

    let report = manager.dump_asset_history(&asset, true, true);
    assert!(report.repository_error.is_some());
    assert!(report.repository_versions.is_none());
}
