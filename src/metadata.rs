//! Version metadata attached to every stored asset.
//!
//! [`AssetMetadata`] is the caller-supplied record: who made the version,
//! with which tool, and whatever else the pipeline wants to carry along in
//! `custom_data`. It is immutable once handed to a backend — backends copy
//! it into their sidecar and never touch it again.
//!
//! Everything dynamic stays dynamic: `custom_data` and the reference
//! metadata flowing through the history reconciler are [`MetadataMap`]s,
//! an ordered string-keyed map of arbitrary JSON values. Known fields are
//! only ever normalized at the point where a component actually consumes
//! them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque string-keyed metadata. The `BTreeMap` keeps iteration and
/// serialization order deterministic.
pub type MetadataMap = BTreeMap<String, serde_json::Value>;

/// Metadata describing one logical version of an asset.
///
/// `tags` is an ordered sequence; duplicates are allowed and order is
/// preserved. Unknown keys encountered when reading a record back (backend
/// sidecars inject their own fields) are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadata {
    /// Name of the creator.
    pub creator: String,
    /// Version of the tool that produced the asset.
    pub tool_version: String,
    /// Optional free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered tags, duplicates allowed.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Arbitrary pipeline-specific data.
    #[serde(default)]
    pub custom_data: MetadataMap,
    /// When the metadata record was created. Defaults to now.
    #[serde(default = "Utc::now")]
    pub creation_time: DateTime<Utc>,
}

impl AssetMetadata {
    /// Creates a record with the two required fields; everything else is
    /// filled in through the `with_*` builders.
    pub fn new(creator: impl Into<String>, tool_version: impl Into<String>) -> Self {
        Self {
            creator: creator.into(),
            tool_version: tool_version.into(),
            description: None,
            tags: Vec::new(),
            custom_data: MetadataMap::new(),
            creation_time: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_custom(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.custom_data.insert(key.into(), value.into());
        self
    }

    /// Flattens the record into a [`MetadataMap`], the form backends write
    /// into their sidecars before injecting their own keys.
    pub fn to_map(&self) -> MetadataMap {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(fields)) => fields.into_iter().collect(),
            _ => MetadataMap::new(),
        }
    }

    /// Reads a record back out of a sidecar map. Backend-injected keys are
    /// ignored; missing required fields are an error.
    pub fn from_map(map: &MetadataMap) -> Result<Self, serde_json::Error> {
        let object: serde_json::Map<String, serde_json::Value> =
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        serde_json::from_value(serde_json::Value::Object(object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_optional_fields() {
        let meta = AssetMetadata::new("jane", "maya-2026")
            .with_description("blocked-in silhouette")
            .with_tags(["character", "wip", "character"])
            .with_custom("resolution", "4k");

        assert_eq!(meta.creator, "jane");
        assert_eq!(meta.tags, vec!["character", "wip", "character"]);
        assert_eq!(
            meta.custom_data.get("resolution"),
            Some(&serde_json::Value::String("4k".into()))
        );
    }

    #[test]
    fn map_round_trip_ignores_injected_keys() {
        let meta = AssetMetadata::new("jane", "maya-2026").with_tags(["a", "b"]);
        let mut map = meta.to_map();
        map.insert("original_path".into(), "/tmp/asset.ma".into());
        map.insert("timestamp".into(), "2026-01-01T00:00:00Z".into());

        let back = AssetMetadata::from_map(&map).expect("round trip");
        assert_eq!(back, meta);
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let mut map = MetadataMap::new();
        map.insert("creator".into(), "jane".into());
        assert!(AssetMetadata::from_map(&map).is_err());
    }
}
