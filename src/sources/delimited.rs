//! Delimited text tool output (CSV / TSV)
//!
//! The first row is the header. Rows are read flexibly so that a row with the
//! wrong number of values reaches the mapper, which skips and logs it.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use super::{RecordSource, SourceField};
use crate::engine::types::{RawRecord, RawValue, SourceItem};
use crate::error::{SourceError, SourceResult};

/// Extensions recognized as tool output (compared case-insensitively)
pub const OUTPUT_EXTENSIONS: &[&str] = &["csv", "tsv"];

pub struct DelimitedSource {
    name: String,
    item: SourceItem,
    fields: Vec<SourceField>,
    records: csv::StringRecordsIntoIter<File>,
    line: u64,
}

impl DelimitedSource {
    /// Open a file, choosing tab for `.tsv` and comma otherwise
    pub fn open(path: &Path) -> SourceResult<Self> {
        let delimiter = match extension(path).as_deref() {
            Some("tsv") => b'\t',
            _ => b',',
        };
        Self::open_with_delimiter(path, delimiter)
    }

    pub fn open_with_delimiter(path: &Path, delimiter: u8) -> SourceResult<Self> {
        let file = File::open(path).map_err(|e| SourceError::io(path, e))?;
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(delimiter)
            .from_reader(file);
        let mut records = reader.into_records();

        let fields = match records.next() {
            Some(header) => header?
                .iter()
                .map(|h| SourceField::new(h.trim_start_matches('\u{feff}')))
                .collect(),
            None => Vec::new(),
        };
        debug!(path = %path.display(), fields = fields.len(), "Opened delimited output");

        let item = SourceItem::from_path(path);
        Ok(Self {
            name: item.name.clone(),
            item,
            fields,
            records,
            line: 1,
        })
    }
}

impl RecordSource for DelimitedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self) -> &'static str {
        "delimited"
    }

    fn source_item(&self) -> &SourceItem {
        &self.item
    }

    fn fields(&self) -> &[SourceField] {
        &self.fields
    }

    fn next_record(&mut self) -> Option<SourceResult<RawRecord>> {
        let result = self.records.next()?;
        self.line += 1;
        Some(match result {
            Ok(row) => {
                let line = row.position().map(|p| p.line()).unwrap_or(self.line);
                trace!(line, values = row.len(), "Read row");
                Ok(RawRecord::new(line, row.iter().map(RawValue::from).collect()))
            }
            Err(e) => match e.kind() {
                csv::ErrorKind::Utf8 { .. } => Err(SourceError::Record {
                    line: e.position().map(|p| p.line()).unwrap_or(self.line),
                    message: e.to_string(),
                }),
                _ => Err(SourceError::Csv(e)),
            },
        })
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_ascii_lowercase())
}

/// Recursively find tool output files under a directory, sorted by path
pub fn find_tool_output_files(dir: &Path) -> SourceResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(SourceError::io(
            dir,
            std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
        ));
    }
    let mut found = Vec::new();
    collect_outputs(dir, &mut found)?;
    found.sort();
    Ok(found)
}

fn collect_outputs(dir: &Path, found: &mut Vec<PathBuf>) -> SourceResult<()> {
    let entries = fs::read_dir(dir).map_err(|e| SourceError::io(dir, e))?;
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let path = entry.path();
        if path.is_dir() {
            collect_outputs(&path, found)?;
        } else if extension(&path).is_some_and(|ext| OUTPUT_EXTENSIONS.contains(&ext.as_str())) {
            found.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn write_temp(suffix: &str, content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_header_and_rows() {
        let file = write_temp(".csv", "ID,SYSTEM_TIME,NOTE\n7,2021-01-01 00:00:00,hello\n8,x\n");
        let mut source = DelimitedSource::open(file.path()).unwrap();
        let names: Vec<_> = source.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["ID", "SYSTEM_TIME", "NOTE"]);

        let first = source.next_record().unwrap().unwrap();
        assert_eq!(first.line, 2);
        assert_eq!(first.values[2], RawValue::from("hello"));

        // Short rows are passed through for the mapper to reject
        let second = source.next_record().unwrap().unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second.line, 3);
        assert!(source.next_record().is_none());
    }

    #[test]
    fn test_tab_delimited() {
        let file = write_temp(".tsv", "a\tb\n1\t2\n");
        let mut source = DelimitedSource::open(file.path()).unwrap();
        assert_eq!(source.fields().len(), 2);
        assert_eq!(source.next_record().unwrap().unwrap().values, vec![RawValue::from("1"), RawValue::from("2")]);
    }

    #[test]
    fn test_empty_file_has_no_fields() {
        let file = write_temp(".csv", "");
        let mut source = DelimitedSource::open(file.path()).unwrap();
        assert!(source.fields().is_empty());
        assert!(source.next_record().is_none());
    }

    #[test]
    fn test_find_tool_output_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("b.csv"), "x\n").unwrap();
        fs::write(dir.path().join("nested").join("a.TSV"), "x\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "x\n").unwrap();

        let found = find_tool_output_files(dir.path()).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().any(|p| p.ends_with("b.csv")));
        assert!(found.iter().any(|p| p.ends_with("nested/a.TSV")));
        assert!(find_tool_output_files(&dir.path().join("missing")).is_err());
    }
}
