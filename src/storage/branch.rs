//! Branch-per-version storage on a git repository.
//!
//! Every stored version is materialized as a dedicated branch named
//! `<prefix>/<version id>`, created off whatever branch is active at store
//! time. The content file and its `<name>.metadata.json` sidecar are
//! committed on that branch, and the previously active branch is checked
//! out again before the call returns.
//!
//! The working tree and HEAD are shared mutable state. Every operation
//! that moves HEAD arms a [`RestoreGuard`] first: the guard checks the
//! original branch back out on *every* exit path — explicit restore on
//! success, drop on error. What the guard cannot give you is isolation
//! between concurrent calls on the same instance; two interleaved
//! checkouts corrupt each other. One instance admits one writer; use one
//! instance per working tree if you need parallelism.
//!
//! Retrieval without an explicit target copies the bytes into a cache
//! directory under `.git/assetvault/` so the returned path remains valid
//! after the branch restore.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, TimeZone, Utc};
use git2::build::CheckoutBuilder;
use git2::{BranchType, Repository, Signature};
use tracing::{debug, info_span, warn, Span};

use crate::error::{Result, VaultError};
use crate::metadata::{AssetMetadata, MetadataMap};
use crate::storage::{ReferenceType, StorageBackend, StorageReference};

const STORAGE_TYPE: &str = "branch";
const DEFAULT_PREFIX: &str = "asset-versions";
const SIDECAR_SUFFIX: &str = ".metadata.json";
const SEED_FILE: &str = "README.md";

fn giterr(message: &str) -> impl FnOnce(git2::Error) -> VaultError + '_ {
    move |e| VaultError::backend_with(STORAGE_TYPE, message, e)
}

fn checkout(repo: &Repository, branch: &str) -> std::result::Result<(), git2::Error> {
    let refname = format!("refs/heads/{branch}");
    let object = repo.revparse_single(&refname)?;
    let mut options = CheckoutBuilder::new();
    options.force();
    repo.checkout_tree(&object, Some(&mut options))?;
    repo.set_head(&refname)
}

/// Scoped branch acquisition: checks the original branch back out on every
/// exit path. Call [`restore`](Self::restore) on the success path so a
/// failing restore surfaces; the drop impl covers error paths best-effort.
struct RestoreGuard<'a> {
    repo: &'a Repository,
    original: String,
    armed: bool,
}

impl<'a> RestoreGuard<'a> {
    fn new(repo: &'a Repository, original: String) -> Self {
        Self {
            repo,
            original,
            armed: true,
        }
    }

    fn restore(mut self) -> Result<()> {
        self.armed = false;
        checkout(self.repo, &self.original)
            .map_err(giterr("failed to restore original branch"))
    }
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = checkout(self.repo, &self.original) {
                warn!(branch = %self.original, error = %e, "branch restore failed during unwind");
            }
        }
    }
}

/// Branch-per-version store over a git working tree.
pub struct BranchStore {
    repo: Repository,
    workdir: PathBuf,
    branch_prefix: String,
    span: Span,
}

impl BranchStore {
    /// Opens (initializing if needed) the repository at `repo_path`, using
    /// the default `asset-versions` branch prefix.
    pub fn new(repo_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_prefix(repo_path, DEFAULT_PREFIX)
    }

    /// Opens (initializing if needed) the repository at `repo_path` with
    /// an explicit branch prefix.
    pub fn with_prefix(repo_path: impl AsRef<Path>, branch_prefix: impl Into<String>) -> Result<Self> {
        let repo_path = repo_path.as_ref();
        let repo = match Repository::open(repo_path) {
            Ok(repo) => repo,
            Err(_) => Repository::init(repo_path)
                .map_err(giterr("failed to initialize repository"))?,
        };
        let workdir = repo
            .workdir()
            .ok_or_else(|| {
                VaultError::backend(STORAGE_TYPE, "repository has no working tree")
            })?
            .to_path_buf();
        let span = info_span!("branch_store", repo = %repo_path.display());

        let store = Self {
            repo,
            workdir,
            branch_prefix: branch_prefix.into(),
            span,
        };
        store.ensure_initial_commit()?;
        Ok(store)
    }

    fn signature(&self) -> Result<Signature<'static>> {
        // Fall back to a fixed identity when the repository has no
        // user.name/user.email configured.
        self.repo
            .signature()
            .or_else(|_| Signature::now("assetvault", "assetvault@localhost"))
            .map_err(giterr("failed to build commit signature"))
    }

    fn ensure_initial_commit(&self) -> Result<()> {
        if self.repo.head().is_ok() {
            return Ok(());
        }
        let seed = self.workdir.join(SEED_FILE);
        fs::write(&seed, "# Asset version storage\n")
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to seed repository", e))?;
        let mut index = self.repo.index().map_err(giterr("failed to open index"))?;
        index
            .add_path(Path::new(SEED_FILE))
            .map_err(giterr("failed to stage seed file"))?;
        index.write().map_err(giterr("failed to write index"))?;
        let tree_id = index.write_tree().map_err(giterr("failed to write tree"))?;
        let tree = self
            .repo
            .find_tree(tree_id)
            .map_err(giterr("failed to look up tree"))?;
        let sig = self.signature()?;
        self.repo
            .commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .map_err(giterr("failed to create initial commit"))?;
        Ok(())
    }

    fn current_branch(&self) -> Result<String> {
        let head = self.repo.head().map_err(giterr("failed to resolve HEAD"))?;
        if !head.is_branch() {
            return Err(VaultError::backend(
                STORAGE_TYPE,
                "HEAD is detached; a named branch must be checked out",
            ));
        }
        head.shorthand()
            .map(String::from)
            .ok_or_else(|| VaultError::backend(STORAGE_TYPE, "active branch has no utf-8 name"))
    }

    fn branch_name(&self, version_id: &str) -> String {
        format!("{}/{}", self.branch_prefix, version_id)
    }

    fn require_version_branch(&self, storage_id: &str) -> Result<String> {
        let name = self.branch_name(storage_id);
        self.repo
            .find_branch(&name, BranchType::Local)
            .map_err(|_| VaultError::not_found(STORAGE_TYPE, storage_id))?;
        Ok(name)
    }

    /// Commits the currently staged paths on HEAD.
    fn commit_paths(&self, paths: &[&Path], message: &str) -> Result<()> {
        let mut index = self.repo.index().map_err(giterr("failed to open index"))?;
        for path in paths {
            index
                .add_path(path)
                .map_err(giterr("failed to stage file"))?;
        }
        index.write().map_err(giterr("failed to write index"))?;
        let tree_id = index.write_tree().map_err(giterr("failed to write tree"))?;
        let tree = self
            .repo
            .find_tree(tree_id)
            .map_err(giterr("failed to look up tree"))?;
        let parent = self
            .repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(giterr("failed to resolve branch head"))?;
        let sig = self.signature()?;
        self.repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
            .map_err(giterr("failed to commit"))?;
        Ok(())
    }

    /// The first non-sidecar, non-seed file in the working tree, by name.
    fn asset_file(&self) -> Result<Option<PathBuf>> {
        let mut names = Vec::new();
        let entries = fs::read_dir(&self.workdir)
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to read working tree", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| {
                VaultError::backend_with(STORAGE_TYPE, "failed to read working tree", e)
            })?;
            if entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == SEED_FILE || name.ends_with(SIDECAR_SUFFIX) {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names.first().map(|n| self.workdir.join(n)))
    }

    fn sidecar_file(&self) -> Result<Option<PathBuf>> {
        let entries = fs::read_dir(&self.workdir)
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to read working tree", e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                VaultError::backend_with(STORAGE_TYPE, "failed to read working tree", e)
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(SIDECAR_SUFFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names.first().map(|n| self.workdir.join(n)))
    }

    fn commit_timestamp(time: git2::Time) -> String {
        Utc.timestamp_opt(time.seconds(), 0)
            .single()
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default()
    }
}

impl StorageBackend for BranchStore {
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
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                VaultError::backend(STORAGE_TYPE, format!("{} has no file name", file.display()))
            })?;

        let hash = hex::encode(blake3::hash(&content).as_bytes());
        let version_id = format!("{}-{}", &hash[..12], Utc::now().timestamp_millis());
        let branch = self.branch_name(&version_id);

        let original = self.current_branch()?;
        let head = self
            .repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(giterr("failed to resolve branch head"))?;
        self.repo
            .branch(&branch, &head, false)
            .map_err(giterr("failed to create version branch"))?;

        let guard = RestoreGuard::new(&self.repo, original);
        checkout(&self.repo, &branch).map_err(giterr("failed to check out version branch"))?;

        fs::write(self.workdir.join(&file_name), &content)
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to write content", e))?;

        let timestamp = Utc::now();
        let mut map = metadata.to_map();
        map.insert("original_path".into(), file.display().to_string().into());
        map.insert(
            "timestamp".into(),
            timestamp
                .to_rfc3339_opts(SecondsFormat::Micros, true)
                .into(),
        );
        let sidecar_name = format!("{file_name}{SIDECAR_SUFFIX}");
        let sidecar_json = serde_json::to_vec_pretty(&map)
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to encode sidecar", e))?;
        fs::write(self.workdir.join(&sidecar_name), sidecar_json)
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to write sidecar", e))?;

        self.commit_paths(
            &[Path::new(&file_name), Path::new(&sidecar_name)],
            &format!("Store version of {file_name}"),
        )?;

        guard.restore()?;
        debug!(id = %version_id, branch = %branch, "stored version");
        Ok(version_id)
    }

    fn retrieve(&mut self, storage_id: &str, target: Option<&Path>) -> Result<PathBuf> {
        let _enter = self.span.enter();
        let branch = self.require_version_branch(storage_id)?;
        let original = self.current_branch()?;

        let guard = RestoreGuard::new(&self.repo, original);
        checkout(&self.repo, &branch).map_err(giterr("failed to check out version branch"))?;

        let source = self
            .asset_file()?
            .ok_or_else(|| VaultError::not_found(STORAGE_TYPE, storage_id))?;

        let destination = match target {
            Some(target) => target.to_path_buf(),
            // The working tree reverts on restore; park the bytes in a
            // cache the backend owns so the returned path stays valid.
            None => {
                let cache = self.repo.path().join("assetvault").join(storage_id);
                fs::create_dir_all(&cache).map_err(|e| {
                    VaultError::backend_with(STORAGE_TYPE, "failed to create retrieval cache", e)
                })?;
                cache.join(source.file_name().expect("asset file has a name"))
            }
        };
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                VaultError::backend_with(STORAGE_TYPE, "failed to create target directory", e)
            })?;
        }
        fs::copy(&source, &destination)
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to copy content", e))?;

        guard.restore()?;
        Ok(destination)
    }

    fn describe(&mut self, storage_id: &str) -> Result<MetadataMap> {
        let _enter = self.span.enter();
        let branch = self.require_version_branch(storage_id)?;
        let original = self.current_branch()?;

        let guard = RestoreGuard::new(&self.repo, original);
        checkout(&self.repo, &branch).map_err(giterr("failed to check out version branch"))?;

        let sidecar = self
            .sidecar_file()?
            .ok_or_else(|| VaultError::not_found(STORAGE_TYPE, storage_id))?;
        let bytes = fs::read(&sidecar)
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to read sidecar", e))?;
        let mut map: MetadataMap = serde_json::from_slice(&bytes)
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "malformed sidecar", e))?;

        let commit = self
            .repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(giterr("failed to resolve branch head"))?;
        map.insert("commit_hash".into(), commit.id().to_string().into());
        map.insert(
            "commit_date".into(),
            Self::commit_timestamp(commit.time()).into(),
        );
        map.insert(
            "commit_message".into(),
            commit.message().unwrap_or_default().into(),
        );
        map.insert("branch".into(), branch.clone().into());

        guard.restore()?;
        Ok(map)
    }

    fn create_from_reference(
        &mut self,
        reference: &StorageReference,
        metadata: &AssetMetadata,
    ) -> Result<String> {
        let _enter = self.span.enter();
        if reference.reference_type != ReferenceType::Commit {
            return Err(VaultError::unsupported_reference(
                STORAGE_TYPE,
                reference.reference_type,
            ));
        }

        let commit = self
            .repo
            .revparse_single(&reference.storage_id)
            .and_then(|o| o.peel_to_commit())
            .map_err(|e| {
                VaultError::backend_with(
                    STORAGE_TYPE,
                    format!("referenced commit {} not found", reference.storage_id),
                    e,
                )
            })?;
        let version_id = commit.id().to_string()[..12].to_string();
        let branch = self.branch_name(&version_id);
        self.repo
            .branch(&branch, &commit, false)
            .map_err(giterr("failed to create version branch"))?;

        let mut map = metadata.to_map();
        map.insert("commit_hash".into(), commit.id().to_string().into());
        map.insert(
            "commit_date".into(),
            Self::commit_timestamp(commit.time()).into(),
        );
        map.insert(
            "commit_message".into(),
            commit.message().unwrap_or_default().into(),
        );
        map.insert(
            "original_path".into(),
            reference.path.display().to_string().into(),
        );
        map.insert(
            "reference".into(),
            serde_json::to_value(reference).map_err(|e| {
                VaultError::backend_with(STORAGE_TYPE, "failed to encode reference", e)
            })?,
        );

        let name = reference
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "asset".to_string());
        let sidecar_name = format!("{name}{SIDECAR_SUFFIX}");

        let original = self.current_branch()?;
        let guard = RestoreGuard::new(&self.repo, original);
        checkout(&self.repo, &branch).map_err(giterr("failed to check out version branch"))?;

        let sidecar_json = serde_json::to_vec_pretty(&map)
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to encode sidecar", e))?;
        fs::write(self.workdir.join(&sidecar_name), sidecar_json)
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to write sidecar", e))?;
        self.commit_paths(
            &[Path::new(&sidecar_name)],
            &format!("Add metadata for {name}"),
        )?;

        guard.restore()?;
        debug!(id = %version_id, branch = %branch, "created version from commit reference");
        Ok(version_id)
    }

    fn list_references(
        &mut self,
        reference_type: Option<ReferenceType>,
        path_pattern: Option<&str>,
    ) -> Result<Vec<StorageReference>> {
        let _enter = self.span.enter();
        if reference_type.is_some_and(|t| t != ReferenceType::Commit) {
            return Ok(Vec::new());
        }

        let mut walk = self.repo.revwalk().map_err(giterr("failed to start revwalk"))?;
        walk.push_glob("refs/heads/*")
            .map_err(giterr("failed to push branch heads"))?;

        let mut refs = Vec::new();
        for oid in walk {
            let oid = oid.map_err(giterr("failed to walk commits"))?;
            let commit = self
                .repo
                .find_commit(oid)
                .map_err(giterr("failed to look up commit"))?;
            let tree = commit.tree().map_err(giterr("failed to look up tree"))?;
            let parent_tree = match commit.parent(0) {
                Ok(parent) => Some(parent.tree().map_err(giterr("failed to look up tree"))?),
                Err(_) => None,
            };
            let diff = self
                .repo
                .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)
                .map_err(giterr("failed to diff commit"))?;

            for delta in diff.deltas() {
                let Some(path) = delta.new_file().path() else {
                    continue;
                };
                if path.to_string_lossy().ends_with(SIDECAR_SUFFIX) {
                    continue;
                }
                if let Some(pattern) = path_pattern {
                    if !path.display().to_string().contains(pattern) {
                        continue;
                    }
                }

                let author = commit.author();
                let mut detail = MetadataMap::new();
                detail.insert(
                    "commit_date".into(),
                    Self::commit_timestamp(commit.time()).into(),
                );
                detail.insert(
                    "commit_message".into(),
                    commit.message().unwrap_or_default().into(),
                );
                detail.insert("author".into(), author.name().unwrap_or_default().into());
                detail.insert(
                    "author_email".into(),
                    author.email().unwrap_or_default().into(),
                );

                refs.push(StorageReference {
                    storage_type: STORAGE_TYPE.to_string(),
                    storage_id: oid.to_string(),
                    path: path.to_path_buf(),
                    reference_type: ReferenceType::Commit,
                    metadata: detail,
                });
            }
        }
        Ok(refs)
    }
}
