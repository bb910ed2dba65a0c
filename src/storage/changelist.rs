//! Changelist-based storage.
//!
//! Every stored version becomes one submitted changelist carrying the
//! asset file and a JSON metadata file under the store's metadata depot
//! path. The changelist number is the storage id.
//!
//! The store talks to the changelist system through the
//! [`ChangelistClient`] seam. [`P4Cli`] implements it over the `p4`
//! command line client; tests substitute a scripted in-memory client, so
//! the store's own logic — staging, submit sequencing, metadata
//! augmentation — is exercised without a server.
//!
//! Metadata payloads are staged in a [`tempfile::NamedTempFile`], whose
//! drop removes the file on every exit path, success or failure.
//!
//! Like the branch store, a changelist store instance admits one writer at
//! a time: pending changelists and the client workspace are shared state.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info_span, Span};

use crate::error::{Result, VaultError};
use crate::metadata::{AssetMetadata, MetadataMap};
use crate::storage::{ReferenceType, StorageBackend, StorageReference};

const STORAGE_TYPE: &str = "changelist";
const DEFAULT_METADATA_DEPOT: &str = "//depot/asset-versions/metadata";

/// A submitted or pending changelist, as reported by the server.
#[derive(Debug, Clone, Default)]
pub struct ChangeInfo {
    pub change: String,
    pub description: String,
    pub user: String,
    pub client: String,
    /// Submission time as the server reports it (epoch seconds for p4).
    pub time: String,
}

/// One depot file touched by a changelist.
#[derive(Debug, Clone)]
pub struct DepotFile {
    pub depot_path: String,
    pub action: String,
}

/// The operations the changelist store needs from the underlying system.
///
/// The real implementation is [`P4Cli`]; tests provide scripted ones.
pub trait ChangelistClient {
    /// Opens a new numbered changelist with the given description.
    fn create_change(&mut self, description: &str) -> Result<String>;

    /// Adds (or opens for edit) a workspace file in the changelist.
    fn add_file(&mut self, change: &str, local_path: &Path) -> Result<()>;

    /// Adds a local file into the changelist under an explicit depot path.
    fn add_file_as(&mut self, change: &str, local_path: &Path, depot_path: &str) -> Result<()>;

    /// Submits the changelist.
    fn submit(&mut self, change: &str) -> Result<()>;

    /// Describes a changelist; fails if it does not exist.
    fn describe_change(&mut self, change: &str) -> Result<ChangeInfo>;

    /// Lists the depot files of a changelist.
    fn files_in(&mut self, change: &str) -> Result<Vec<DepotFile>>;

    /// Prints a depot file at a changelist into `target`.
    fn print_file(&mut self, depot_path: &str, change: &str, target: &Path) -> Result<()>;

    /// Syncs a depot file at a changelist into the workspace and returns
    /// the workspace path.
    fn sync_file(&mut self, depot_path: &str, change: &str) -> Result<PathBuf>;

    /// Lists submitted changelists, newest first.
    fn changes(&mut self) -> Result<Vec<ChangeInfo>>;
}

/// Changelist-per-version store.
pub struct ChangelistStore {
    client: Box<dyn ChangelistClient>,
    metadata_depot: String,
    span: Span,
}

impl ChangelistStore {
    pub fn new(client: Box<dyn ChangelistClient>) -> Self {
        Self::with_metadata_depot(client, DEFAULT_METADATA_DEPOT)
    }

    pub fn with_metadata_depot(
        client: Box<dyn ChangelistClient>,
        metadata_depot: impl Into<String>,
    ) -> Self {
        Self {
            client,
            metadata_depot: metadata_depot.into(),
            span: info_span!("changelist_store"),
        }
    }

    fn metadata_depot_path(&self, change: &str) -> String {
        format!("{}/{change}.json", self.metadata_depot)
    }

    fn is_metadata_path(&self, depot_path: &str) -> bool {
        depot_path.starts_with(&self.metadata_depot)
    }

    /// Stages `map` as JSON in a temp file and attaches it to the
    /// changelist under the metadata depot path. The returned guard keeps
    /// the staged file alive until after submit; its drop removes the file
    /// on every exit path.
    fn attach_metadata(
        &mut self,
        change: &str,
        map: &MetadataMap,
    ) -> Result<tempfile::NamedTempFile> {
        let mut staged = tempfile::Builder::new()
            .prefix("assetvault-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| {
                VaultError::backend_with(STORAGE_TYPE, "failed to stage metadata", e)
            })?;
        let json = serde_json::to_vec_pretty(map)
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to encode metadata", e))?;
        staged
            .write_all(&json)
            .and_then(|_| staged.flush())
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to stage metadata", e))?;

        let depot_path = self.metadata_depot_path(change);
        self.client.add_file_as(change, staged.path(), &depot_path)?;
        Ok(staged)
    }
}

impl StorageBackend for ChangelistStore {
    fn storage_type(&self) -> &'static str {
        STORAGE_TYPE
    }

    fn store(&mut self, file: &Path, metadata: &AssetMetadata) -> Result<String> {
        let _enter = self.span.clone().entered();
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                VaultError::backend(STORAGE_TYPE, format!("{} has no file name", file.display()))
            })?;

        let change = self
            .client
            .create_change(&format!("Store version of {name}\n\nManaged by assetvault"))?;
        self.client.add_file(&change, file)?;

        let mut map = metadata.to_map();
        map.insert("original_path".into(), file.display().to_string().into());
        map.insert("changelist".into(), change.clone().into());
        map.insert(
            "timestamp".into(),
            Utc::now()
                .to_rfc3339_opts(SecondsFormat::Micros, true)
                .into(),
        );
        let _staged = self.attach_metadata(&change, &map)?;

        self.client.submit(&change)?;
        debug!(id = %change, "submitted version changelist");
        Ok(change)
    }

    fn retrieve(&mut self, storage_id: &str, target: Option<&Path>) -> Result<PathBuf> {
        let _enter = self.span.enter();
        let files = self.client.files_in(storage_id)?;
        let asset = files
            .iter()
            .find(|f| !self.is_metadata_path(&f.depot_path))
            .ok_or_else(|| VaultError::not_found(STORAGE_TYPE, storage_id))?
            .clone();

        match target {
            Some(target) => {
                self.client
                    .print_file(&asset.depot_path, storage_id, target)?;
                Ok(target.to_path_buf())
            }
            None => self.client.sync_file(&asset.depot_path, storage_id),
        }
    }

    fn describe(&mut self, storage_id: &str) -> Result<MetadataMap> {
        let _enter = self.span.enter();
        let depot_path = self.metadata_depot_path(storage_id);
        let staged = tempfile::Builder::new()
            .prefix("assetvault-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| {
                VaultError::backend_with(STORAGE_TYPE, "failed to stage metadata", e)
            })?;
        // A missing metadata file is the backend's definition of an
        // unknown id.
        if self
            .client
            .print_file(&depot_path, storage_id, staged.path())
            .is_err()
        {
            return Err(VaultError::not_found(STORAGE_TYPE, storage_id));
        }
        let bytes = std::fs::read(staged.path())
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to read metadata", e))?;
        let mut map: MetadataMap = serde_json::from_slice(&bytes)
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "malformed metadata", e))?;

        let info = self.client.describe_change(storage_id)?;
        map.insert("changelist".into(), info.change.into());
        map.insert("description".into(), info.description.into());
        map.insert("user".into(), info.user.into());
        map.insert("client".into(), info.client.into());
        map.insert("time".into(), info.time.into());
        Ok(map)
    }

    fn create_from_reference(
        &mut self,
        reference: &StorageReference,
        metadata: &AssetMetadata,
    ) -> Result<String> {
        let _enter = self.span.clone().entered();
        if reference.reference_type != ReferenceType::Changelist {
            return Err(VaultError::unsupported_reference(
                STORAGE_TYPE,
                reference.reference_type,
            ));
        }

        let source = self.client.describe_change(&reference.storage_id)?;
        let change = self.client.create_change(&format!(
            "Add metadata for {}\n\nReferencing changelist {}",
            reference.path.display(),
            reference.storage_id
        ))?;

        let mut map = metadata.to_map();
        map.insert(
            "original_changelist".into(),
            reference.storage_id.clone().into(),
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
        map.insert(
            "timestamp".into(),
            Utc::now()
                .to_rfc3339_opts(SecondsFormat::Micros, true)
                .into(),
        );
        map.insert(
            "source_change".into(),
            serde_json::json!({
                "description": source.description,
                "user": source.user,
                "client": source.client,
                "time": source.time,
            }),
        );

        let _staged = self.attach_metadata(&change, &map)?;
        self.client.submit(&change)?;
        debug!(id = %change, source = %reference.storage_id, "created version from changelist reference");
        Ok(change)
    }

    fn list_references(
        &mut self,
        reference_type: Option<ReferenceType>,
        path_pattern: Option<&str>,
    ) -> Result<Vec<StorageReference>> {
        let _enter = self.span.enter();
        if reference_type.is_some_and(|t| t != ReferenceType::Changelist) {
            return Ok(Vec::new());
        }

        let changes = self.client.changes()?;
        let mut refs = Vec::new();
        for info in changes {
            let files = self.client.files_in(&info.change)?;
            let assets: Vec<_> = files
                .into_iter()
                .filter(|f| !self.is_metadata_path(&f.depot_path))
                .collect();
            // Metadata-only changelists are bookkeeping, not versions.
            if assets.is_empty() {
                continue;
            }

            for file in assets {
                if let Some(pattern) = path_pattern {
                    if !file.depot_path.contains(pattern) {
                        continue;
                    }
                }
                let mut detail = MetadataMap::new();
                detail.insert("description".into(), info.description.clone().into());
                detail.insert("user".into(), info.user.clone().into());
                detail.insert("client".into(), info.client.clone().into());
                detail.insert("time".into(), info.time.clone().into());
                detail.insert("action".into(), file.action.clone().into());

                refs.push(StorageReference {
                    storage_type: STORAGE_TYPE.to_string(),
                    storage_id: info.change.clone(),
                    path: PathBuf::from(&file.depot_path),
                    reference_type: ReferenceType::Changelist,
                    metadata: detail,
                });
            }
        }
        Ok(refs)
    }
}

/// [`ChangelistClient`] over the `p4` command line client.
///
/// Connection settings are passed on every invocation; no state is kept
/// between calls beyond what the server and workspace hold.
pub struct P4Cli {
    port: String,
    user: String,
    client: String,
    password: Option<String>,
}

impl P4Cli {
    pub fn new(
        port: impl Into<String>,
        user: impl Into<String>,
        client: impl Into<String>,
    ) -> Self {
        Self {
            port: port.into(),
            user: user.into(),
            client: client.into(),
            password: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("p4");
        cmd.args(["-p", &self.port, "-u", &self.user, "-c", &self.client]);
        if let Some(password) = &self.password {
            cmd.env("P4PASSWD", password);
        }
        cmd
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = self
            .command()
            .args(args)
            .output()
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to invoke p4", e))?;
        if !output.status.success() {
            return Err(VaultError::backend(
                STORAGE_TYPE,
                format!(
                    "p4 {} failed: {}",
                    args.first().unwrap_or(&""),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_with_input(&self, args: &[&str], input: &str) -> Result<String> {
        let mut child = self
            .command()
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to invoke p4", e))?;
        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(input.as_bytes())
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to feed p4 form", e))?;
        let output = child
            .wait_with_output()
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to invoke p4", e))?;
        if !output.status.success() {
            return Err(VaultError::backend(
                STORAGE_TYPE,
                format!(
                    "p4 {} failed: {}",
                    args.first().unwrap_or(&""),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Runs `p4 -Ztag` and splits the tagged output into records of
    /// `key -> value` pairs. Records are separated by blank lines; each
    /// field line reads `... key value`.
    fn run_tagged(&self, args: &[&str]) -> Result<Vec<BTreeMap<String, String>>> {
        let mut full = vec!["-Ztag"];
        full.extend_from_slice(args);
        let output = self
            .command()
            .args(&full)
            .output()
            .map_err(|e| VaultError::backend_with(STORAGE_TYPE, "failed to invoke p4", e))?;
        if !output.status.success() {
            return Err(VaultError::backend(
                STORAGE_TYPE,
                format!(
                    "p4 {} failed: {}",
                    args.first().unwrap_or(&""),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        let mut records = Vec::new();
        let mut current: BTreeMap<String, String> = BTreeMap::new();
        for line in text.lines() {
            let Some(field) = line.strip_prefix("... ") else {
                if line.trim().is_empty() && !current.is_empty() {
                    records.push(std::mem::take(&mut current));
                }
                continue;
            };
            match field.split_once(' ') {
                Some((key, value)) => current.insert(key.to_string(), value.to_string()),
                None => current.insert(field.to_string(), String::new()),
            };
        }
        if !current.is_empty() {
            records.push(current);
        }
        Ok(records)
    }

    fn change_info(record: &BTreeMap<String, String>) -> ChangeInfo {
        ChangeInfo {
            change: record.get("change").cloned().unwrap_or_default(),
            description: record.get("desc").cloned().unwrap_or_default(),
            user: record.get("user").cloned().unwrap_or_default(),
            client: record.get("client").cloned().unwrap_or_default(),
            time: record.get("time").cloned().unwrap_or_default(),
        }
    }
}

impl ChangelistClient for P4Cli {
    fn create_change(&mut self, description: &str) -> Result<String> {
        let mut form = format!(
            "Change:\tnew\n\nClient:\t{}\n\nUser:\t{}\n\nStatus:\tnew\n\nDescription:\n",
            self.client, self.user
        );
        for line in description.lines() {
            form.push('\t');
            form.push_str(line);
            form.push('\n');
        }

        let output = self.run_with_input(&["change", "-i"], &form)?;
        // "Change 12345 created."
        output
            .split_whitespace()
            .nth(1)
            .map(str::to_string)
            .ok_or_else(|| {
                VaultError::backend(STORAGE_TYPE, format!("unexpected change output: {output}"))
            })
    }

    fn add_file(&mut self, change: &str, local_path: &Path) -> Result<()> {
        let path = local_path.display().to_string();
        if self.run(&["add", "-c", change, &path]).is_ok() {
            return Ok(());
        }
        // Already in the depot; open it for edit instead.
        self.run(&["edit", "-c", change, &path]).map(|_| ())
    }

    fn add_file_as(&mut self, change: &str, local_path: &Path, depot_path: &str) -> Result<()> {
        let path = local_path.display().to_string();
        self.run(&["add", "-c", change, "-t", "text", &path, depot_path])
            .map(|_| ())
    }

    fn submit(&mut self, change: &str) -> Result<()> {
        self.run(&["submit", "-c", change]).map(|_| ())
    }

    fn describe_change(&mut self, change: &str) -> Result<ChangeInfo> {
        let records = self.run_tagged(&["describe", "-s", change])?;
        records
            .first()
            .map(Self::change_info)
            .ok_or_else(|| {
                VaultError::backend(STORAGE_TYPE, format!("changelist {change} not found"))
            })
    }

    fn files_in(&mut self, change: &str) -> Result<Vec<DepotFile>> {
        let spec = format!("@={change}");
        let records = self.run_tagged(&["files", &spec])?;
        Ok(records
            .iter()
            .filter_map(|r| {
                r.get("depotFile").map(|depot_path| DepotFile {
                    depot_path: depot_path.clone(),
                    action: r.get("action").cloned().unwrap_or_default(),
                })
            })
            .collect())
    }

    fn print_file(&mut self, depot_path: &str, change: &str, target: &Path) -> Result<()> {
        let spec = format!("{depot_path}@{change}");
        let out = target.display().to_string();
        self.run(&["print", "-q", "-o", &out, &spec]).map(|_| ())
    }

    fn sync_file(&mut self, depot_path: &str, change: &str) -> Result<PathBuf> {
        let spec = format!("{depot_path}@{change}");
        let records = self.run_tagged(&["fstat", &spec])?;
        let local = records
            .first()
            .and_then(|r| r.get("clientFile"))
            .ok_or_else(|| {
                VaultError::backend(STORAGE_TYPE, format!("no workspace mapping for {depot_path}"))
            })?
            .clone();
        self.run(&["sync", &spec])?;
        Ok(PathBuf::from(local))
    }

    fn changes(&mut self) -> Result<Vec<ChangeInfo>> {
        let records = self.run_tagged(&["changes", "-l", "-s", "submitted"])?;
        Ok(records.iter().map(Self::change_info).collect())
    }
}
