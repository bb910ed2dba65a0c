//! SQLite-backed version repository.
//!
//! Four tables: `versions` (one row per logical version), `version_storage`
//! (one row per backend that stored it), `tags` and `version_tags` (tag
//! set, many-to-many). Timestamps are RFC 3339 UTC text, so range filters
//! compare correctly as strings; `custom_data` is a JSON column.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info_span, Span};

use crate::error::{Result, VaultError};
use crate::metadata::{AssetMetadata, MetadataMap};
use crate::repo::{StorageLocation, VersionQuery, VersionRecord, VersionRepository};

fn db(message: &'static str) -> impl FnOnce(rusqlite::Error) -> VaultError {
    move |e| VaultError::repository_with(message, e)
}

fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn time_text(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| VaultError::repository_with(format!("malformed timestamp {text:?}"), e))
}

/// Version repository over a SQLite database.
pub struct SqliteRepository {
    conn: Connection,
    span: Span,
}

impl SqliteRepository {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(db("failed to open database"))?;
        Self::with_connection(conn)
    }

    /// An in-memory repository, mainly for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db("failed to open database"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let repo = Self {
            conn,
            span: info_span!("sqlite_repository"),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS versions (
                     id INTEGER PRIMARY KEY,
                     file_path TEXT NOT NULL,
                     creator TEXT NOT NULL,
                     tool_version TEXT NOT NULL,
                     description TEXT,
                     created_at TEXT NOT NULL,
                     custom_data TEXT NOT NULL DEFAULT '{}'
                 );
                 CREATE TABLE IF NOT EXISTS version_storage (
                     id INTEGER PRIMARY KEY,
                     version_id INTEGER NOT NULL
                         REFERENCES versions(id) ON DELETE CASCADE,
                     storage_type TEXT NOT NULL,
                     storage_id TEXT NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS tags (
                     id INTEGER PRIMARY KEY,
                     name TEXT NOT NULL UNIQUE
                 );
                 CREATE TABLE IF NOT EXISTS version_tags (
                     version_id INTEGER NOT NULL
                         REFERENCES versions(id) ON DELETE CASCADE,
                     tag_id INTEGER NOT NULL REFERENCES tags(id),
                     PRIMARY KEY (version_id, tag_id)
                 );
                 CREATE INDEX IF NOT EXISTS idx_versions_file_path
                     ON versions(file_path);
                 CREATE INDEX IF NOT EXISTS idx_version_storage_version
                     ON version_storage(version_id);",
            )
            .map_err(db("failed to initialize schema"))
    }

    fn attach_tags(&self, version_id: i64, tags: &[String]) -> Result<()> {
        // Tag rows are a set; duplicate tags in the metadata collapse here.
        for tag in tags.iter().collect::<BTreeSet<_>>() {
            self.conn
                .execute("INSERT OR IGNORE INTO tags (name) VALUES (?1)", params![tag])
                .map_err(db("failed to insert tag"))?;
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO version_tags (version_id, tag_id)
                     SELECT ?1, id FROM tags WHERE name = ?2",
                    params![version_id, tag],
                )
                .map_err(db("failed to attach tag"))?;
        }
        Ok(())
    }

    fn tags_of(&self, version_id: i64) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT t.name FROM tags t
                 JOIN version_tags vt ON vt.tag_id = t.id
                 WHERE vt.version_id = ?1
                 ORDER BY t.name",
            )
            .map_err(db("failed to prepare tag query"))?;
        let names = stmt
            .query_map(params![version_id], |row| row.get::<_, String>(0))
            .map_err(db("failed to query tags"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db("failed to read tags"))?;
        Ok(names)
    }

    fn record_from_row(
        &self,
        id: i64,
        file_path: String,
        creator: String,
        tool_version: String,
        description: Option<String>,
        created_at: String,
        custom_data: String,
    ) -> Result<VersionRecord> {
        let custom_data: MetadataMap = serde_json::from_str(&custom_data)
            .map_err(|e| VaultError::repository_with("malformed custom_data column", e))?;
        Ok(VersionRecord {
            id,
            file_path,
            creator,
            tool_version,
            description,
            created_at: parse_time(&created_at)?,
            custom_data,
            tags: self.tags_of(id)?,
        })
    }

    /// Every tag name known to the repository.
    pub fn get_all_tags(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM tags ORDER BY name")
            .map_err(db("failed to prepare tag query"))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db("failed to query tags"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db("failed to read tags"))?;
        Ok(names)
    }

    /// Every version created by `creator`.
    pub fn get_versions_by_creator(&self, creator: &str) -> Result<Vec<VersionRecord>> {
        self.find_versions(&VersionQuery::new().with_creator(creator))
    }

    /// Versions of one file, newest first.
    pub fn get_version_history(&self, file_path: &Path) -> Result<Vec<VersionRecord>> {
        let mut versions = self.find_versions(&VersionQuery::for_path(file_path))?;
        versions.reverse();
        Ok(versions)
    }

    /// Deletes a version; its storage locations and tag links cascade.
    pub fn delete_version(&self, version_id: i64) -> Result<()> {
        let _enter = self.span.enter();
        self.conn
            .execute("DELETE FROM versions WHERE id = ?1", params![version_id])
            .map_err(db("failed to delete version"))?;
        Ok(())
    }

    /// Updates the mutable parts of a version record. Absent arguments
    /// leave the stored value untouched; a tags argument replaces the
    /// whole tag set.
    pub fn update_version_metadata(
        &self,
        version_id: i64,
        description: Option<&str>,
        tags: Option<&[String]>,
        custom_data: Option<&MetadataMap>,
    ) -> Result<VersionRecord> {
        let _enter = self.span.enter();
        // Probe first so an unknown id reports as missing rather than as a
        // zero-row update.
        self.get_version_info(version_id)?;

        if let Some(description) = description {
            self.conn
                .execute(
                    "UPDATE versions SET description = ?1 WHERE id = ?2",
                    params![description, version_id],
                )
                .map_err(db("failed to update description"))?;
        }
        if let Some(custom_data) = custom_data {
            let json = serde_json::to_string(custom_data)
                .map_err(|e| VaultError::repository_with("failed to encode custom_data", e))?;
            self.conn
                .execute(
                    "UPDATE versions SET custom_data = ?1 WHERE id = ?2",
                    params![json, version_id],
                )
                .map_err(db("failed to update custom_data"))?;
        }
        if let Some(tags) = tags {
            self.conn
                .execute(
                    "DELETE FROM version_tags WHERE version_id = ?1",
                    params![version_id],
                )
                .map_err(db("failed to clear tags"))?;
            self.attach_tags(version_id, tags)?;
        }
        self.get_version_info(version_id)
    }
}

impl VersionRepository for SqliteRepository {
    fn create_version(&self, file_path: &Path, metadata: &AssetMetadata) -> Result<i64> {
        let _enter = self.span.enter();
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(db("failed to begin transaction"))?;

        let custom_data = serde_json::to_string(&metadata.custom_data)
            .map_err(|e| VaultError::repository_with("failed to encode custom_data", e))?;
        tx.execute(
            "INSERT INTO versions
                 (file_path, creator, tool_version, description, created_at, custom_data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                file_path.display().to_string(),
                metadata.creator,
                metadata.tool_version,
                metadata.description,
                now_text(),
                custom_data,
            ],
        )
        .map_err(db("failed to insert version"))?;
        let version_id = tx.last_insert_rowid();

        self.attach_tags(version_id, &metadata.tags)?;
        tx.commit().map_err(db("failed to commit version"))?;

        debug!(version_id, path = %file_path.display(), "created repository version");
        Ok(version_id)
    }

    fn add_storage_location(
        &self,
        version_id: i64,
        storage_type: &str,
        storage_id: &str,
    ) -> Result<()> {
        let _enter = self.span.enter();
        self.conn
            .execute(
                "INSERT INTO version_storage
                     (version_id, storage_type, storage_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![version_id, storage_type, storage_id, now_text()],
            )
            .map_err(db("failed to insert storage location"))?;
        Ok(())
    }

    fn get_version_info(&self, version_id: i64) -> Result<VersionRecord> {
        let _enter = self.span.enter();
        let row = self
            .conn
            .query_row(
                "SELECT id, file_path, creator, tool_version, description,
                        created_at, custom_data
                 FROM versions WHERE id = ?1",
                params![version_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(db("failed to query version"))?
            .ok_or_else(|| VaultError::not_found("repository", version_id.to_string()))?;

        self.record_from_row(row.0, row.1, row.2, row.3, row.4, row.5, row.6)
    }

    fn get_storage_locations(&self, version_id: i64) -> Result<Vec<StorageLocation>> {
        let _enter = self.span.enter();
        let mut stmt = self
            .conn
            .prepare(
                "SELECT storage_type, storage_id, created_at
                 FROM version_storage WHERE version_id = ?1 ORDER BY id",
            )
            .map_err(db("failed to prepare location query"))?;
        let rows = stmt
            .query_map(params![version_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(db("failed to query locations"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db("failed to read locations"))?;

        rows.into_iter()
            .map(|(storage_type, storage_id, created_at)| {
                Ok(StorageLocation {
                    storage_type,
                    storage_id,
                    created_at: parse_time(&created_at)?,
                })
            })
            .collect()
    }

    fn find_versions(&self, query: &VersionQuery) -> Result<Vec<VersionRecord>> {
        let _enter = self.span.enter();
        let mut sql = String::from(
            "SELECT id, file_path, creator, tool_version, description,
                    created_at, custom_data
             FROM versions WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();

        if let Some(path) = &query.file_path {
            sql.push_str(" AND file_path = ?");
            args.push(path.display().to_string());
        }
        if let Some(creator) = &query.creator {
            sql.push_str(" AND creator = ?");
            args.push(creator.clone());
        }
        if let Some(after) = query.after {
            sql.push_str(" AND created_at >= ?");
            args.push(time_text(after));
        }
        if let Some(before) = query.before {
            sql.push_str(" AND created_at <= ?");
            args.push(time_text(before));
        }
        for tag in query.tags.iter().flatten() {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM version_tags vt
                              JOIN tags t ON t.id = vt.tag_id
                              WHERE vt.version_id = versions.id AND t.name = ?)",
            );
            args.push(tag.clone());
        }
        sql.push_str(" ORDER BY created_at, id");

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(db("failed to prepare version query"))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .map_err(db("failed to query versions"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db("failed to read versions"))?;

        rows.into_iter()
            .map(|row| self.record_from_row(row.0, row.1, row.2, row.3, row.4, row.5, row.6))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> AssetMetadata {
        AssetMetadata::new("jane", "maya-2026")
            .with_description("first pass")
            .with_tags(["character", "texture", "character"])
            .with_custom("resolution", "4k")
    }

    #[test]
    fn create_and_read_back() {
        let repo = SqliteRepository::in_memory().unwrap();
        let id = repo
            .create_version(Path::new("assets/hero.ma"), &sample_metadata())
            .unwrap();

        let record = repo.get_version_info(id).unwrap();
        assert_eq!(record.file_path, "assets/hero.ma");
        assert_eq!(record.creator, "jane");
        assert_eq!(record.description.as_deref(), Some("first pass"));
        // Duplicate tags collapse to a set.
        assert_eq!(record.tags, vec!["character", "texture"]);
        assert_eq!(
            record.custom_data.get("resolution"),
            Some(&serde_json::Value::String("4k".into()))
        );
    }

    #[test]
    fn unknown_version_is_not_found() {
        let repo = SqliteRepository::in_memory().unwrap();
        let err = repo.get_version_info(999).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn storage_locations_accumulate_per_backend() {
        let repo = SqliteRepository::in_memory().unwrap();
        let id = repo
            .create_version(Path::new("a.png"), &sample_metadata())
            .unwrap();
        repo.add_storage_location(id, "disk", "abc_1").unwrap();
        repo.add_storage_location(id, "branch", "def-2").unwrap();

        let locations = repo.get_storage_locations(id).unwrap();
        assert_eq!(locations.len(), 2);
        assert_eq!(locations[0].storage_type, "disk");
        assert_eq!(locations[1].storage_type, "branch");
    }

    #[test]
    fn find_versions_applies_every_filter() {
        let repo = SqliteRepository::in_memory().unwrap();
        let meta_a = AssetMetadata::new("jane", "t1").with_tags(["a", "shared"]);
        let meta_b = AssetMetadata::new("john", "t1").with_tags(["b", "shared"]);
        repo.create_version(Path::new("x.png"), &meta_a).unwrap();
        repo.create_version(Path::new("y.png"), &meta_b).unwrap();

        let by_path = repo
            .find_versions(&VersionQuery::for_path("x.png"))
            .unwrap();
        assert_eq!(by_path.len(), 1);
        assert_eq!(by_path[0].creator, "jane");

        let by_creator = repo
            .find_versions(&VersionQuery::new().with_creator("john"))
            .unwrap();
        assert_eq!(by_creator.len(), 1);

        let by_shared_tag = repo
            .find_versions(&VersionQuery::new().with_tags(["shared"]))
            .unwrap();
        assert_eq!(by_shared_tag.len(), 2);

        let by_both_tags = repo
            .find_versions(&VersionQuery::new().with_tags(["shared", "a"]))
            .unwrap();
        assert_eq!(by_both_tags.len(), 1);

        let none = repo
            .find_versions(&VersionQuery::new().with_tags(["missing"]))
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn time_window_filters_use_creation_instant() {
        let repo = SqliteRepository::in_memory().unwrap();
        let before_insert = Utc::now();
        repo.create_version(Path::new("a.png"), &sample_metadata())
            .unwrap();
        let after_insert = Utc::now();

        let hit = repo
            .find_versions(
                &VersionQuery::new()
                    .with_after(before_insert)
                    .with_before(after_insert),
            )
            .unwrap();
        assert_eq!(hit.len(), 1);

        let past_creation = hit[0].created_at + chrono::Duration::microseconds(1);
        let miss = repo
            .find_versions(&VersionQuery::new().with_after(past_creation))
            .unwrap();
        assert!(miss.is_empty());
    }

    #[test]
    fn delete_cascades_locations_and_tag_links() {
        let repo = SqliteRepository::in_memory().unwrap();
        let id = repo
            .create_version(Path::new("a.png"), &sample_metadata())
            .unwrap();
        repo.add_storage_location(id, "disk", "abc").unwrap();

        repo.delete_version(id).unwrap();
        assert!(repo.get_version_info(id).unwrap_err().is_not_found());
        assert!(repo.get_storage_locations(id).unwrap().is_empty());
        // Tag names survive; only the links go away.
        assert_eq!(repo.get_all_tags().unwrap(), vec!["character", "texture"]);
    }

    #[test]
    fn update_replaces_only_what_is_given() {
        let repo = SqliteRepository::in_memory().unwrap();
        let id = repo
            .create_version(Path::new("a.png"), &sample_metadata())
            .unwrap();

        let tags = vec!["final".to_string()];
        let updated = repo
            .update_version_metadata(id, Some("approved"), Some(&tags), None)
            .unwrap();
        assert_eq!(updated.description.as_deref(), Some("approved"));
        assert_eq!(updated.tags, vec!["final"]);
        // custom_data untouched.
        assert_eq!(
            updated.custom_data.get("resolution"),
            Some(&serde_json::Value::String("4k".into()))
        );
    }

    #[test]
    fn version_history_is_newest_first() {
        let repo = SqliteRepository::in_memory().unwrap();
        let first = repo
            .create_version(Path::new("a.png"), &sample_metadata())
            .unwrap();
        let second = repo
            .create_version(Path::new("a.png"), &sample_metadata())
            .unwrap();

        let history = repo.get_version_history(Path::new("a.png")).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second);
        assert_eq!(history[1].id, first);
    }
}
