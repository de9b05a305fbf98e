//! SQLite case database
//!
//! Tables:
//! - `attribute_types` - one row per qualified attribute type name (UNIQUE)
//! - `artifact_kinds` - registered artifact kinds
//! - `artifacts` - one row per artifact, tagged with kind and source item
//! - `attributes` - typed values attached to artifacts
//!
//! Batches are written in a single transaction so readers never observe an
//! artifact with only part of its attributes.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info};

use super::{validate_type_name, KnowledgeStore};
use crate::engine::types::{
    ArtifactBatch, ArtifactKind, ArtifactRef, AttributeTypeHandle, CoercedValue, SourceItem, TypedAttribute, ValueKind,
};
use crate::error::{StoreError, StoreResult};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

// ============================================================================
// Setup
// ============================================================================

impl SqliteStore {
    /// Open (or create) a case database at the given path
    pub fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!("Opening case database at: {:?}", db_path);
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Default case database location under the user data directory
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ffx-ingest")
            .join("case.db")
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("database lock poisoned".to_string()))
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS attribute_types (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type_name TEXT NOT NULL UNIQUE,
                value_kind TEXT NOT NULL,
                display_name TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS artifact_kinds (
                name TEXT PRIMARY KEY,
                display_name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS artifacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                source_id TEXT NOT NULL,
                source_name TEXT NOT NULL,
                module_name TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS attributes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                artifact_id INTEGER NOT NULL,
                attribute_type_id INTEGER NOT NULL,
                namespace TEXT NOT NULL,
                value_type TEXT NOT NULL,
                value_text TEXT,
                value_int INTEGER,
                value_real REAL,
                FOREIGN KEY (artifact_id) REFERENCES artifacts(id) ON DELETE CASCADE,
                FOREIGN KEY (attribute_type_id) REFERENCES attribute_types(id)
            );

            CREATE INDEX IF NOT EXISTS idx_artifacts_kind_source ON artifacts(kind, source_id);
            CREATE INDEX IF NOT EXISTS idx_attributes_artifact ON attributes(artifact_id);
        "#,
        )?;

        Ok(())
    }
}

// ============================================================================
// Read Helpers
// ============================================================================

impl SqliteStore {
    pub fn attribute_type_count(&self) -> StoreResult<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM attribute_types", [], |row| row.get(0))?)
    }

    pub fn artifact_count(&self, kind: &str) -> StoreResult<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM artifacts WHERE kind = ?1",
            params![kind],
            |row| row.get(0),
        )?)
    }

    /// (type name, value) pairs attached to an artifact, in insertion order
    pub fn artifact_attributes(&self, artifact_id: i64) -> StoreResult<Vec<(String, CoercedValue)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT t.type_name, a.value_type, a.value_text, a.value_int, a.value_real
             FROM attributes a JOIN attribute_types t ON t.id = a.attribute_type_id
             WHERE a.artifact_id = ?1 ORDER BY a.id",
        )?;

        let rows = stmt.query_map(params![artifact_id], |row| {
            let type_name: String = row.get(0)?;
            let value_type: String = row.get(1)?;
            let value = match value_type.as_str() {
                "int64" => CoercedValue::Int64(row.get(3)?),
                "epoch_seconds" => CoercedValue::EpochSeconds(row.get(3)?),
                "float64" => CoercedValue::Float64(row.get(4)?),
                _ => CoercedValue::String(row.get::<_, Option<String>>(2)?.unwrap_or_default()),
            };
            Ok((type_name, value))
        })?;

        let attributes = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(attributes)
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn insert_attribute(conn: &Connection, artifact_id: i64, attribute: &TypedAttribute) -> rusqlite::Result<()> {
    let (value_type, text, int, real): (&str, Option<&str>, Option<i64>, Option<f64>) = match &attribute.value {
        CoercedValue::String(s) => ("string", Some(s.as_str()), None, None),
        CoercedValue::Int64(n) => ("int64", None, Some(*n), None),
        CoercedValue::EpochSeconds(n) => ("epoch_seconds", None, Some(*n), None),
        CoercedValue::Float64(f) => ("float64", None, None, Some(*f)),
    };
    conn.execute(
        "INSERT INTO attributes (artifact_id, attribute_type_id, namespace, value_type, value_text, value_int, value_real)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            artifact_id,
            attribute.attribute_type.id(),
            attribute.namespace,
            value_type,
            text,
            int,
            real
        ],
    )?;
    Ok(())
}

// ============================================================================
// KnowledgeStore
// ============================================================================

impl KnowledgeStore for SqliteStore {
    fn lookup_attribute_type(&self, type_name: &str) -> StoreResult<Option<AttributeTypeHandle>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, type_name, value_kind, display_name FROM attribute_types WHERE type_name = ?1",
                params![type_name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, name, kind, display)) => {
                let kind = ValueKind::parse(&kind)
                    .ok_or_else(|| StoreError::InvalidName(format!("{} has unknown kind {}", name, kind)))?;
                Ok(Some(AttributeTypeHandle::new(id, name, kind, display)))
            }
            None => Ok(None),
        }
    }

    fn create_attribute_type(
        &self,
        type_name: &str,
        kind: ValueKind,
        display_name: &str,
    ) -> StoreResult<AttributeTypeHandle> {
        validate_type_name(type_name)?;
        let conn = self.lock()?;
        let now = chrono::Utc::now().to_rfc3339();
        match conn.execute(
            "INSERT INTO attribute_types (type_name, value_kind, display_name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![type_name, kind.as_str(), display_name, now],
        ) {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                debug!(type_name, kind = %kind, id, "Created attribute type");
                Ok(AttributeTypeHandle::new(id, type_name, kind, display_name))
            }
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(type_name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn post_artifacts(&self, batch: ArtifactBatch) -> StoreResult<Vec<ArtifactRef>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().to_rfc3339();

        for merge in &batch.merges {
            let exists: i64 = tx.query_row(
                "SELECT COUNT(*) FROM artifacts WHERE id = ?1",
                params![merge.target.id],
                |row| row.get(0),
            )?;
            if exists == 0 {
                // Dropping the transaction rolls back
                return Err(StoreError::UnknownArtifact(merge.target.id));
            }
            for attribute in &merge.attributes {
                insert_attribute(&tx, merge.target.id, attribute)?;
            }
        }

        let mut refs = Vec::with_capacity(batch.new_artifacts.len());
        for artifact in &batch.new_artifacts {
            tx.execute(
                "INSERT INTO artifacts (kind, source_id, source_name, module_name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    artifact.kind.name,
                    artifact.source.id,
                    artifact.source.name,
                    batch.module_name,
                    now
                ],
            )?;
            let id = tx.last_insert_rowid();
            for attribute in &artifact.attributes {
                insert_attribute(&tx, id, attribute)?;
            }
            refs.push(ArtifactRef {
                id,
                kind: artifact.kind.name.clone(),
                source_id: artifact.source.id.clone(),
            });
        }

        tx.commit()?;
        Ok(refs)
    }

    fn find_existing_artifact(&self, kind: &str, source: &SourceItem) -> StoreResult<Option<ArtifactRef>> {
        let conn = self.lock()?;
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM artifacts WHERE kind = ?1 AND source_id = ?2 ORDER BY id LIMIT 1",
                params![kind, source.id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(id.map(|id| ArtifactRef {
            id,
            kind: kind.to_string(),
            source_id: source.id.clone(),
        }))
    }

    fn get_or_add_artifact_kind(&self, kind: &ArtifactKind) -> StoreResult<()> {
        validate_type_name(&kind.name)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO artifact_kinds (name, display_name) VALUES (?1, ?2)
             ON CONFLICT(name) DO NOTHING",
            params![kind.name, kind.display_name],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{Artifact, ArtifactMerge};
    use tempfile::TempDir;

    fn string_attr(handle: &AttributeTypeHandle, value: &str) -> TypedAttribute {
        TypedAttribute {
            attribute_type: handle.clone(),
            namespace: "test".into(),
            value: CoercedValue::String(value.into()),
        }
    }

    #[test]
    fn test_attribute_type_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(&dir.path().join("case.db")).unwrap();

        assert!(store.lookup_attribute_type("CS_ID").unwrap().is_none());
        let created = store.create_attribute_type("CS_ID", ValueKind::Integer, "ID").unwrap();
        let found = store.lookup_attribute_type("CS_ID").unwrap().unwrap();
        assert_eq!(created, found);

        let err = store.create_attribute_type("CS_ID", ValueKind::Integer, "ID").unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.attribute_type_count().unwrap(), 1);
    }

    #[test]
    fn test_conflict_across_connections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("case.db");
        let first = SqliteStore::open(&path).unwrap();
        let second = SqliteStore::open(&path).unwrap();

        first.create_attribute_type("CS_LEVEL", ValueKind::String, "LEVEL").unwrap();
        assert!(matches!(
            second.create_attribute_type("CS_LEVEL", ValueKind::String, "LEVEL"),
            Err(StoreError::Conflict(_))
        ));
        assert!(second.lookup_attribute_type("CS_LEVEL").unwrap().is_some());
    }

    #[test]
    fn test_post_batch_and_merge() {
        let store = SqliteStore::open_in_memory().unwrap();
        let name = store.create_attribute_type("RA_NAME", ValueKind::String, "Name").unwrap();
        let when = store.create_attribute_type("RA_DATE", ValueKind::DateTime, "Date").unwrap();
        let source = SourceItem::new("/sys/SystemVersion.plist", "SystemVersion.plist");
        let kind = ArtifactKind::new("TSK_OS_INFO", "Operating System Information");
        store.get_or_add_artifact_kind(&kind).unwrap();
        store.get_or_add_artifact_kind(&kind).unwrap();

        let refs = store
            .post_artifacts(ArtifactBatch {
                module_name: "test".into(),
                new_artifacts: vec![Artifact {
                    kind: kind.clone(),
                    source: source.clone(),
                    attributes: vec![string_attr(&name, "macOS")],
                }],
                merges: vec![],
            })
            .unwrap();

        let existing = store.find_existing_artifact("TSK_OS_INFO", &source).unwrap().unwrap();
        assert_eq!(existing.id, refs[0].id);

        store
            .post_artifacts(ArtifactBatch {
                module_name: "test".into(),
                new_artifacts: vec![],
                merges: vec![ArtifactMerge {
                    target: existing.clone(),
                    attributes: vec![TypedAttribute {
                        attribute_type: when,
                        namespace: "test".into(),
                        value: CoercedValue::EpochSeconds(978_307_200),
                    }],
                }],
            })
            .unwrap();

        let attrs = store.artifact_attributes(existing.id).unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0], ("RA_NAME".to_string(), CoercedValue::String("macOS".into())));
        assert_eq!(attrs[1], ("RA_DATE".to_string(), CoercedValue::EpochSeconds(978_307_200)));
        assert_eq!(store.artifact_count("TSK_OS_INFO").unwrap(), 1);
    }

    #[test]
    fn test_failed_batch_rolls_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        let name = store.create_attribute_type("CS_NOTE", ValueKind::String, "NOTE").unwrap();
        let result = store.post_artifacts(ArtifactBatch {
            module_name: "test".into(),
            new_artifacts: vec![],
            merges: vec![ArtifactMerge {
                target: ArtifactRef {
                    id: 99,
                    kind: "CS_X".into(),
                    source_id: "x".into(),
                },
                attributes: vec![string_attr(&name, "lost")],
            }],
        });
        assert!(matches!(result, Err(StoreError::UnknownArtifact(99))));
        assert_eq!(store.artifact_count("CS_X").unwrap(), 0);
    }
}
