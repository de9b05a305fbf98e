//! Rows of a query against an embedded SQLite database
//!
//! The database is opened read-only. Rows are fetched in pages by wrapping
//! the query as `SELECT * FROM (<query>) LIMIT ? OFFSET ?`, so very large
//! tables never sit in memory at once.

use std::collections::VecDeque;
use std::path::Path;

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags};
use tracing::{debug, trace};

use super::{RecordSource, SourceField};
use crate::common::SQLITE_PAGE_ROWS;
use crate::engine::types::{RawRecord, RawValue, SourceItem, ValueKind};
use crate::error::SourceResult;

pub struct SqliteSource {
    conn: Connection,
    item: SourceItem,
    query: String,
    fields: Vec<SourceField>,
    page: VecDeque<RawRecord>,
    page_size: usize,
    offset: usize,
    exhausted: bool,
}

/// Kind hint from a column's declared type
fn decltype_hint(decl: &str) -> Option<ValueKind> {
    let decl = decl.to_ascii_uppercase();
    if decl.contains("DATE") || decl.contains("TIME") {
        Some(ValueKind::DateTime)
    } else if decl.contains("INT") {
        Some(ValueKind::Long)
    } else if decl.contains("REAL") || decl.contains("FLOA") || decl.contains("DOUB") {
        Some(ValueKind::Double)
    } else {
        None
    }
}

fn to_raw(value: ValueRef<'_>) -> RawValue {
    match value {
        ValueRef::Null => RawValue::Null,
        ValueRef::Integer(n) => RawValue::Integer(n),
        ValueRef::Real(f) => RawValue::Real(f),
        ValueRef::Text(bytes) => RawValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => RawValue::Bytes(bytes.to_vec()),
    }
}

impl SqliteSource {
    pub fn open(path: &Path, query: &str) -> SourceResult<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Self::with_connection(conn, SourceItem::from_path(path), query)
    }

    /// Use an already open connection (e.g. a database extracted to memory)
    pub fn with_connection(conn: Connection, item: SourceItem, query: &str) -> SourceResult<Self> {
        let query = query.trim().trim_end_matches(';').trim().to_string();
        let fields = {
            let stmt = conn.prepare(&query)?;
            stmt.columns()
                .iter()
                .map(|col| SourceField {
                    name: col.name().to_string(),
                    hint: col.decl_type().and_then(decltype_hint),
                })
                .collect::<Vec<_>>()
        };
        debug!(source = %item.name, columns = fields.len(), "Prepared SQLite query");

        Ok(Self {
            conn,
            item,
            query,
            fields,
            page: VecDeque::new(),
            page_size: SQLITE_PAGE_ROWS,
            offset: 0,
            exhausted: false,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn fetch_page(&mut self) -> SourceResult<()> {
        let paged = format!("SELECT * FROM ({}) LIMIT ?1 OFFSET ?2", self.query);
        let mut stmt = self.conn.prepare(&paged)?;
        let columns = stmt.column_count();
        let first_line = self.offset as u64 + 1;

        let mut rows = stmt.query(params![self.page_size as i64, self.offset as i64])?;
        let mut fetched = 0usize;
        while let Some(row) = rows.next()? {
            let values = (0..columns)
                .map(|i| row.get_ref(i).map(to_raw))
                .collect::<Result<Vec<_>, _>>()?;
            self.page.push_back(RawRecord::new(first_line + fetched as u64, values));
            fetched += 1;
        }

        trace!(offset = self.offset, fetched, "Fetched SQLite page");
        self.offset += fetched;
        if fetched < self.page_size {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl RecordSource for SqliteSource {
    fn name(&self) -> &str {
        &self.item.name
    }

    fn format(&self) -> &'static str {
        "sqlite"
    }

    fn source_item(&self) -> &SourceItem {
        &self.item
    }

    fn fields(&self) -> &[SourceField] {
        &self.fields
    }

    fn next_record(&mut self) -> Option<SourceResult<RawRecord>> {
        if self.page.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.page.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_db(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("knowledgeC.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE usage (id INTEGER, bundle TEXT, duration REAL, start_date TIMESTAMP, blob BLOB);
             INSERT INTO usage VALUES (1, 'com.apple.Safari', 1.5, 0, x'0A0B');
             INSERT INTO usage VALUES (2, 'com.apple.Mail', NULL, 100, NULL);
             INSERT INTO usage VALUES (3, 'com.apple.Notes', 3.0, 200, NULL);",
        )
        .unwrap();
        path
    }

    #[test]
    fn test_columns_and_hints() {
        let dir = TempDir::new().unwrap();
        let source = SqliteSource::open(&sample_db(&dir), "SELECT * FROM usage;").unwrap();
        let hints: Vec<_> = source.fields().iter().map(|f| (f.name.as_str(), f.hint)).collect();
        assert_eq!(
            hints,
            vec![
                ("id", Some(ValueKind::Long)),
                ("bundle", None),
                ("duration", Some(ValueKind::Double)),
                ("start_date", Some(ValueKind::DateTime)),
                ("blob", None),
            ]
        );
    }

    #[test]
    fn test_paged_rows() {
        let dir = TempDir::new().unwrap();
        let mut source = SqliteSource::open(&sample_db(&dir), "SELECT id, bundle, duration, blob FROM usage ORDER BY id")
            .unwrap()
            .with_page_size(2);

        let mut records = Vec::new();
        while let Some(record) = source.next_record() {
            records.push(record.unwrap());
        }
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].values[0], RawValue::Integer(1));
        assert_eq!(records[0].values[3], RawValue::Bytes(vec![0x0a, 0x0b]));
        assert_eq!(records[1].values[2], RawValue::Null);
        assert_eq!(records[2].line, 3);
        assert_eq!(records[2].values[1], RawValue::from("com.apple.Notes"));
    }

    #[test]
    fn test_bad_query() {
        let dir = TempDir::new().unwrap();
        assert!(SqliteSource::open(&sample_db(&dir), "SELECT * FROM missing").is_err());
    }
}
