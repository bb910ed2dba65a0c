//! Cross-backend history reconciliation.
//!
//! Backends know nothing about each other, and what they can say about
//! their own content varies wildly — a disk store reports sizes and
//! mtimes, a branch store reports commits and authors, a changelist store
//! reports submitting users and epoch seconds. The reconciler pulls every
//! backend's reference listing into one place and merges them into a
//! per-backend summary and a single flattened timeline.
//!
//! Collection is deliberately lossy in one direction only: a backend whose
//! enumeration fails contributes an *empty* listing and a warning, so one
//! misbehaving backend never blocks the history of the others.
//!
//! Timeline events carry a best-effort timestamp: the first present value
//! among the `timestamp`, `time` and `date` metadata keys, rendered to a
//! string once at ingestion. Events sort by that string. Because backends
//! emit different textual formats (RFC 3339 vs. epoch seconds), the sort
//! is lexicographic, not guaranteed chronological — a known gap, kept as
//! documented behavior. Events with no timestamp sort first.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Serialize;
use tracing::{info_span, warn, Span};

use crate::metadata::MetadataMap;
use crate::repo::{StorageLocation, VersionRecord};
use crate::storage::{BackendSet, ReferenceType, StorageReference};

/// Per-backend roll-up of what [`collect_references`] found.
///
/// [`collect_references`]: HistoryReconciler::collect_references
#[derive(Debug, Clone, Serialize)]
pub struct BackendSummary {
    /// Number of references the backend reported.
    pub version_count: usize,
    /// The references themselves, in backend order.
    pub references: Vec<ReferenceDetail>,
    /// For every metadata key observed across the backend's references,
    /// how many distinct values were seen — a coarse variability signal.
    pub unique_values: BTreeMap<String, usize>,
}

/// One reference as it appears inside a [`BackendSummary`].
#[derive(Debug, Clone, Serialize)]
pub struct ReferenceDetail {
    pub id: String,
    pub path: String,
    #[serde(rename = "type")]
    pub reference_type: ReferenceType,
    pub metadata: MetadataMap,
}

/// One event on the merged timeline.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEvent {
    pub storage_type: String,
    pub reference_id: String,
    pub path: String,
    #[serde(rename = "type")]
    pub reference_type: ReferenceType,
    /// Best-effort timestamp string; `None` when the reference carried
    /// none of the recognized keys.
    pub timestamp: Option<String>,
    /// Action label, `"unknown"` when the backend reported none.
    pub action: String,
    pub metadata: MetadataMap,
}

/// One backend version with its full `describe` record, as included in a
/// report when storage data is requested.
#[derive(Debug, Clone, Serialize)]
pub struct StorageVersion {
    pub storage_type: String,
    pub storage_id: String,
    pub path: String,
    pub reference_type: ReferenceType,
    pub metadata: MetadataMap,
}

/// A repository version plus (optionally) where its bytes live.
#[derive(Debug, Clone, Serialize)]
pub struct RepositoryVersionEntry {
    #[serde(flatten)]
    pub version: VersionRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_locations: Option<Vec<StorageLocation>>,
}

/// The composed history report for one asset path.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryReport {
    pub asset_path: String,
    pub storage_summary: BTreeMap<String, BackendSummary>,
    /// Minimum observed `timestamp` string across all references.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_version: Option<String>,
    /// Maximum observed `timestamp` string across all references.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_references: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeline: Option<Vec<TimelineEvent>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_versions: Option<Vec<StorageVersion>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_versions: Option<Vec<RepositoryVersionEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_latest_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_total_versions: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_error: Option<String>,
}

/// Renders a metadata value the way it sorts and displays: strings as
/// themselves, everything else as compact JSON.
fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Merges per-backend reference listings into summaries and a timeline.
pub struct HistoryReconciler<'a> {
    backends: &'a mut BackendSet,
    span: Span,
}

impl<'a> HistoryReconciler<'a> {
    pub fn new(backends: &'a mut BackendSet) -> Self {
        Self {
            backends,
            span: info_span!("history_reconciler"),
        }
    }

    /// Asks every backend for its references, optionally filtered to paths
    /// containing `path_filter`. A backend whose enumeration fails
    /// contributes an empty list; the call itself never fails.
    pub fn collect_references(
        &mut self,
        path_filter: Option<&Path>,
    ) -> BTreeMap<String, Vec<StorageReference>> {
        let _enter = self.span.enter();
        let pattern = path_filter.map(|p| p.display().to_string());

        let mut references = BTreeMap::new();
        for (name, backend) in self.backends.iter_mut() {
            let listed = match backend.list_references(None, pattern.as_deref()) {
                Ok(refs) => refs,
                Err(error) => {
                    warn!(backend = name, %error, "reference listing failed; treating as empty");
                    Vec::new()
                }
            };
            references.insert(name.to_string(), listed);
        }
        references
    }

    /// Rolls each backend's references up into a [`BackendSummary`].
    pub fn build_summary(
        &self,
        references: &BTreeMap<String, Vec<StorageReference>>,
    ) -> BTreeMap<String, BackendSummary> {
        let mut summary = BTreeMap::new();
        for (name, refs) in references {
            let mut distinct: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            for reference in refs {
                for (key, value) in &reference.metadata {
                    distinct
                        .entry(key.clone())
                        .or_default()
                        .insert(render_value(value));
                }
            }

            summary.insert(
                name.clone(),
                BackendSummary {
                    version_count: refs.len(),
                    references: refs
                        .iter()
                        .map(|r| ReferenceDetail {
                            id: r.storage_id.clone(),
                            path: r.path.display().to_string(),
                            reference_type: r.reference_type,
                            metadata: r.metadata.clone(),
                        })
                        .collect(),
                    unique_values: distinct
                        .into_iter()
                        .map(|(key, values)| (key, values.len()))
                        .collect(),
                },
            );
        }
        summary
    }

    /// Flattens all references into one event sequence ordered by the
    /// extracted timestamp string. Lexicographic order only — see the
    /// module docs for the cross-format caveat.
    pub fn extract_timeline(
        &self,
        references: &BTreeMap<String, Vec<StorageReference>>,
    ) -> Vec<TimelineEvent> {
        let mut events = Vec::new();
        for (name, refs) in references {
            for reference in refs {
                let timestamp = ["timestamp", "time", "date"]
                    .iter()
                    .find_map(|key| reference.metadata.get(*key))
                    .map(render_value);
                let action = reference
                    .metadata
                    .get("action")
                    .map(render_value)
                    .unwrap_or_else(|| "unknown".to_string());

                events.push(TimelineEvent {
                    storage_type: name.clone(),
                    reference_id: reference.storage_id.clone(),
                    path: reference.path.display().to_string(),
                    reference_type: reference.reference_type,
                    timestamp,
                    action,
                    metadata: reference.metadata.clone(),
                });
            }
        }
        // Missing timestamps sort as the empty string, i.e. first.
        events.sort_by(|a, b| {
            a.timestamp
                .as_deref()
                .unwrap_or_default()
                .cmp(b.timestamp.as_deref().unwrap_or_default())
        });
        events
    }

    /// Composes the full report for one asset path.
    pub fn dump_history(
        &mut self,
        file_path: &Path,
        include_storage_data: bool,
        include_timeline: bool,
    ) -> HistoryReport {
        let references = self.collect_references(Some(file_path));

        let observed: Vec<String> = references
            .values()
            .flatten()
            .filter_map(|r| r.metadata.get("timestamp").map(render_value))
            .collect();
        let total: usize = references.values().map(Vec::len).sum();

        let mut report = HistoryReport {
            asset_path: file_path.display().to_string(),
            storage_summary: self.build_summary(&references),
            first_version: observed.iter().min().cloned(),
            latest_version: observed.iter().max().cloned(),
            total_references: (total > 0).then_some(total),
            timeline: None,
            storage_versions: None,
            repository_versions: None,
            repository_latest_version: None,
            repository_total_versions: None,
            repository_error: None,
        };

        if include_timeline {
            report.timeline = Some(self.extract_timeline(&references));
        }

        if include_storage_data {
            let _enter = self.span.enter();
            let mut versions = Vec::new();
            for (name, refs) in &references {
                let Some(backend) = self.backends.get_mut(name) else {
                    continue;
                };
                for reference in refs {
                    match backend.describe(&reference.storage_id) {
                        Ok(metadata) => versions.push(StorageVersion {
                            storage_type: name.clone(),
                            storage_id: reference.storage_id.clone(),
                            path: reference.path.display().to_string(),
                            reference_type: reference.reference_type,
                            metadata,
                        }),
                        // One undescribable reference costs one entry, not
                        // the whole dump.
                        Err(error) => {
                            warn!(backend = %name, id = %reference.storage_id, %error,
                                  "describe failed; skipping entry");
                        }
                    }
                }
            }
            report.storage_versions = Some(versions);
        }

        report
    }
}
