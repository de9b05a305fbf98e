//! Property list record source
//!
//! Reads XML or binary (`bplist00`) property lists and turns a selected part
//! of the document into records:
//!
//! | Selected value          | Records                                             |
//! |-------------------------|-----------------------------------------------------|
//! | array of dictionaries   | one per element                                     |
//! | dictionary of dicts     | one per entry; the entry key becomes `key_field`    |
//! | any other dictionary    | one record                                          |
//! | scalar                  | one record with a single `VALUE` field              |

pub mod binary;
pub mod value;
pub mod xml;

pub use value::{PlistDict, PlistValue};

use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use tracing::debug;

use super::{RecordSource, SourceField};
use crate::engine::types::{RawRecord, RawValue, SourceItem};
use crate::error::{SourceError, SourceResult};

/// Field holding the dictionary key for dict-of-dict selections, unless configured
pub const DEFAULT_KEY_FIELD: &str = "KEY";

const VALUE_FIELD: &str = "VALUE";

/// Parse a property list, detecting binary vs XML by magic
pub fn parse_plist(data: &[u8]) -> SourceResult<PlistValue> {
    if binary::is_binary_plist(data) {
        binary::parse_binary(data)
    } else {
        xml::parse_xml(data)
    }
}

/// Which part of a property list becomes records, and how
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlistSelection {
    /// Dotted path to the record collection; the root when absent
    pub key_path: Option<String>,
    /// Field name for dictionary keys in dict-of-dict collections
    pub key_field: Option<String>,
    /// Dotted paths to read from each record; the first record's keys when empty
    pub fields: Vec<String>,
}

impl PlistSelection {
    pub fn at(key_path: impl Into<String>) -> Self {
        Self {
            key_path: Some(key_path.into()),
            ..Self::default()
        }
    }

    pub fn keyed_by(mut self, key_field: impl Into<String>) -> Self {
        self.key_field = Some(key_field.into());
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }
}

pub struct PlistSource {
    item: SourceItem,
    fields: Vec<SourceField>,
    records: VecDeque<RawRecord>,
}

impl PlistSource {
    pub fn open(path: &Path, selection: &PlistSelection) -> SourceResult<Self> {
        let data = fs::read(path).map_err(|e| SourceError::io(path, e))?;
        let document = parse_plist(&data)?;
        Self::from_document(SourceItem::from_path(path), &document, selection)
    }

    pub fn from_document(item: SourceItem, document: &PlistValue, selection: &PlistSelection) -> SourceResult<Self> {
        let selected = match &selection.key_path {
            Some(path) => document
                .get_path(path)
                .ok_or_else(|| SourceError::MissingKeyPath(path.clone()))?,
            None => document,
        };
        let key_field = selection.key_field.as_deref().unwrap_or(DEFAULT_KEY_FIELD);
        let rows = select_records(selected, key_field);

        let paths: Vec<String> = if !selection.fields.is_empty() {
            selection.fields.clone()
        } else {
            rows.first().map(|r| r.flatten_keys()).unwrap_or_default()
        };
        let fields = paths
            .iter()
            .map(|path| {
                let hint = rows.first().and_then(|r| r.get_path(path)).and_then(PlistValue::hint);
                SourceField {
                    name: path.clone(),
                    hint,
                }
            })
            .collect();

        let records = rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let values = paths
                    .iter()
                    .map(|path| row.get_path(path).map(PlistValue::to_raw).unwrap_or(RawValue::Null))
                    .collect();
                RawRecord::new(i as u64 + 1, values)
            })
            .collect::<VecDeque<_>>();

        debug!(source = %item.name, records = records.len(), "Selected plist records");
        Ok(Self { item, fields, records })
    }
}

/// Normalize the selected value into a list of record dictionaries
fn select_records(selected: &PlistValue, key_field: &str) -> Vec<PlistValue> {
    let wrap = |value: &PlistValue| PlistValue::Dict(vec![(VALUE_FIELD.to_string(), value.clone())]);
    match selected {
        PlistValue::Array(items) => items
            .iter()
            .map(|item| match item {
                PlistValue::Dict(_) => item.clone(),
                other => wrap(other),
            })
            .collect(),
        PlistValue::Dict(entries)
            if !entries.is_empty() && entries.iter().all(|(_, v)| matches!(v, PlistValue::Dict(_))) =>
        {
            entries
                .iter()
                .map(|(key, value)| {
                    let mut record = vec![(key_field.to_string(), PlistValue::String(key.clone()))];
                    if let PlistValue::Dict(inner) = value {
                        record.extend(inner.iter().cloned());
                    }
                    PlistValue::Dict(record)
                })
                .collect()
        }
        PlistValue::Dict(_) => vec![selected.clone()],
        other => vec![wrap(other)],
    }
}

impl RecordSource for PlistSource {
    fn name(&self) -> &str {
        &self.item.name
    }

    fn format(&self) -> &'static str {
        "plist"
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
