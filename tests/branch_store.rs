use std::fs;
use std::path::Path;

use assetvault::metadata::{AssetMetadata, MetadataMap};
use assetvault::storage::branch::BranchStore;
use assetvault::storage::{ReferenceType, StorageBackend, StorageReference};

fn active_branch(repo_path: &Path) -> String {
    let repo = git2::Repository::open(repo_path).unwrap();
    let branch = repo.head().unwrap().shorthand().unwrap().to_string();
    branch
}

fn head_commit_id(repo_path: &Path) -> String {
    let repo = git2::Repository::open(repo_path).unwrap();
    let commit_id = repo
        .head()
        .unwrap()
        .peel_to_commit()
        .unwrap()
        .id()
        .to_string();
    commit_id
}

#[test]
fn store_commits_on_a_version_branch_and_restores() {
    let tmp = tempfile::tempdir().unwrap();
    let repo_path = tmp.path().join("repo");
    let mut store = BranchStore::new(&repo_path).unwrap();
    let original = active_branch(&repo_path);

    let asset = tmp.path().join("hero.png");
    fs::write(&asset, b"v1").unwrap();
    let id = store
        .store(&asset, &AssetMetadata::new("jane", "maya-2026"))
        .unwrap();

    assert_eq!(active_branch(&repo_path), original);

    let repo = git2::Repository::open(&repo_path).unwrap();
    let branch = repo
        .find_branch(&format!("asset-versions/{id}"), git2::BranchType::Local)
        .unwrap();
    let tree = branch.get().peel_to_commit().unwrap().tree().unwrap();
    assert!(tree.get_name("hero.png").is_some());
    assert!(tree.get_name("hero.png.metadata.json").is_some());
}

#[test]
fn retrieve_round_trips_bytes_and_restores() {
    let tmp = tempfile::tempdir().unwrap();
    let repo_path = tmp.path().join("repo");
    let mut store = BranchStore::new(&repo_path).unwrap();
    let original = active_branch(&repo_path);

    let asset = tmp.path().join("hero.png");
    fs::write(&asset, b"branch payload").unwrap();
    let id = store
        .store(&asset, &AssetMetadata::new("jane", "maya-2026"))
        .unwrap();

    // Without a target the bytes land on a backend-owned path that
    // survives the branch restore.
    let kept = store.retrieve(&id, None).unwrap();
    assert_eq!(fs::read(&kept).unwrap(), b"branch payload");
    assert_eq!(active_branch(&repo_path), original);

    let target = tmp.path().join("restored.png");
    store.retrieve(&id, Some(&target)).unwrap();
    assert_eq!(fs::read(&target).unwrap(), b"branch payload");
    assert_eq!(active_branch(&repo_path), original);
}

#[test]
fn describe_augments_with_commit_details() {
    let tmp = tempfile::tempdir().unwrap();
    let repo_path = tmp.path().join("repo");
    let mut store = BranchStore::new(&repo_path).unwrap();

    let asset = tmp.path().join("hero.png");
    fs::write(&asset, b"v1").unwrap();
    let id = store
        .store(&asset, &AssetMetadata::new("jane", "maya-2026"))
        .unwrap();

    let described = store.describe(&id).unwrap();
    assert_eq!(
        described.get("creator"),
        Some(&serde_json::Value::String("jane".into()))
    );
    assert!(described.contains_key("commit_hash"));
    assert!(described.contains_key("commit_date"));
    assert_eq!(
        described.get("branch"),
        Some(&serde_json::Value::String(format!("asset-versions/{id}")))
    );
}

#[test]
fn unknown_ids_are_not_found_and_leave_the_branch_alone() {
    let tmp = tempfile::tempdir().unwrap();
    let repo_path = tmp.path().join("repo");
    let mut store = BranchStore::new(&repo_path).unwrap();
    let original = active_branch(&repo_path);

    assert!(store.retrieve("nope", None).unwrap_err().is_not_found());
    assert!(store.describe("nope").unwrap_err().is_not_found());
    assert_eq!(active_branch(&repo_path), original);
}

#[test]
fn failure_mid_checkout_still_restores_the_original_branch() {
    let tmp = tempfile::tempdir().unwrap();
    let repo_path = tmp.path().join("repo");
    let mut store = BranchStore::new(&repo_path).unwrap();
    let original = active_branch(&repo_path);

    // A version branch with no sidecar commit: describe finds the branch,
    // checks it out, then fails to locate a metadata record.
    {
        let repo = git2::Repository::open(&repo_path).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch("asset-versions/broken", &head, false).unwrap();
    }

    let err = store.describe("broken").unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(active_branch(&repo_path), original);
}

#[test]
fn commit_reference_promotes_without_new_content() {
    let tmp = tempfile::tempdir().unwrap();
    let repo_path = tmp.path().join("repo");
    let mut store = BranchStore::new(&repo_path).unwrap();
    let original = active_branch(&repo_path);

    let commit_id = head_commit_id(&repo_path);
    let reference = StorageReference {
        storage_type: "branch".into(),
        storage_id: commit_id.clone(),
        path: tmp.path().join("seeded.png"),
        reference_type: ReferenceType::Commit,
        metadata: MetadataMap::new(),
    };
    let id = store
        .create_from_reference(&reference, &AssetMetadata::new("jane", "maya-2026"))
        .unwrap();

    assert_eq!(id, commit_id[..12].to_string());
    assert_eq!(active_branch(&repo_path), original);

    // The sidecar carries the full reference payload; the branch head the
    // describe call reports is the metadata commit itself.
    let described = store.describe(&id).unwrap();
    assert!(described.contains_key("commit_hash"));
    let reference_payload = described.get("reference").unwrap();
    assert_eq!(
        reference_payload.get("storage_id"),
        Some(&serde_json::Value::String(commit_id))
    );
}

#[test]
fn file_references_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = BranchStore::new(tmp.path().join("repo")).unwrap();

    let reference = StorageReference {
        storage_type: "disk".into(),
        storage_id: "abc".into(),
        path: tmp.path().join("x.png"),
        reference_type: ReferenceType::File,
        metadata: MetadataMap::new(),
    };
    let err = store
        .create_from_reference(&reference, &AssetMetadata::new("jane", "maya-2026"))
        .unwrap_err();
    assert!(matches!(
        err,
        assetvault::VaultError::UnsupportedReference { .. }
    ));
}

#[test]
fn list_references_reports_committed_files() {
    let tmp = tempfile::tempdir().unwrap();
    let repo_path = tmp.path().join("repo");
    let mut store = BranchStore::new(&repo_path).unwrap();

    let asset = tmp.path().join("hero.png");
    fs::write(&asset, b"v1").unwrap();
    store
        .store(&asset, &AssetMetadata::new("jane", "maya-2026"))
        .unwrap();

    let refs = store.list_references(None, Some("hero")).unwrap();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].path, Path::new("hero.png"));
    assert_eq!(refs[0].reference_type, ReferenceType::Commit);
    assert!(refs[0].metadata.contains_key("commit_date"));
    assert!(refs[0].metadata.contains_key("author"));

    // Sidecars never show up as references.
    let refs = store.list_references(None, Some("metadata.json")).unwrap();
    assert!(refs.is_empty());

    let refs = store
        .list_references(Some(ReferenceType::Changelist), None)
        .unwrap();
    assert!(refs.is_empty());
}
