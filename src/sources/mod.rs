//! Record sources
//!
//! One implementation per tool output format. Each source exposes its field
//! list up front and then yields raw records in a stable field order.
//!
//! - [`DelimitedSource`] - CSV/TSV tool output (header row + rows)
//! - [`PlistSource`] - XML or binary property lists
//! - [`SqliteSource`] - rows of a query against an embedded SQLite database

pub mod delimited;
pub mod plist;
pub mod sqlite;

pub use delimited::{find_tool_output_files, DelimitedSource};
pub use plist::{PlistSelection, PlistSource};
pub use sqlite::SqliteSource;

use std::collections::VecDeque;

use crate::engine::types::{RawRecord, SourceItem, ValueKind};
use crate::error::SourceResult;

/// A field as the source names it, with an optional native type hint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceField {
    pub name: String,
    pub hint: Option<ValueKind>,
}

impl SourceField {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hint: None,
        }
    }

    pub fn with_hint(name: impl Into<String>, hint: ValueKind) -> Self {
        Self {
            name: name.into(),
            hint: Some(hint),
        }
    }
}

/// Provider of a schema and a stream of raw records
pub trait RecordSource {
    /// Short name for logs (usually the file name)
    fn name(&self) -> &str;

    /// Format label recorded in the audit log
    fn format(&self) -> &'static str;

    /// Item the records were read from
    fn source_item(&self) -> &SourceItem;

    fn fields(&self) -> &[SourceField];

    /// Next record; recoverable errors may be followed by more records
    fn next_record(&mut self) -> Option<SourceResult<RawRecord>>;
}

/// Records already held in memory
pub struct MemorySource {
    item: SourceItem,
    fields: Vec<SourceField>,
    records: VecDeque<RawRecord>,
}

impl MemorySource {
    pub fn new(item: SourceItem, fields: Vec<SourceField>, records: Vec<RawRecord>) -> Self {
        Self {
            item,
            fields,
            records: records.into(),
        }
    }
}

impl RecordSource for MemorySource {
    fn name(&self) -> &str {
        &self.item.name
    }

    fn format(&self) -> &'static str {
        "memory"
    }

    fn source_item(&self) -> &SourceItem {
        &self.item
    }

    fn fields(&self) -> &[SourceField] {
        &self.fields
    }

    fn next_record(&mut self) -> Option<SourceResult<RawRecord>> {
        self.records.pop_front().map(Ok)
    }
}
