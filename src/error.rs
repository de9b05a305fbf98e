//! Error types for the ingestion engine
//!
//! Row and field failures are absorbed by the engine and logged. File and
//! store failures surface to the caller through [`IngestError`].

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::engine::types::ValueKind;

/// Result type alias for whole-file ingestion
pub type IngestResult<T> = Result<T, IngestError>;

/// Result type alias for knowledge store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for record source operations
pub type SourceResult<T> = Result<T, SourceError>;

/// The record source exposed nothing to map.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Source yielded zero fields ("nothing to ingest")
    #[error("source '{source_name}' has no fields")]
    Empty { source_name: String },
}

/// Attribute type could not be resolved; the field is dropped for the run.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Store rejected the creation for a reason other than a conflict
    #[error("cannot create attribute type '{type_name}': {source}")]
    Create {
        type_name: String,
        #[source]
        source: StoreError,
    },
    /// Lookup failed outright
    #[error("cannot look up attribute type '{type_name}': {source}")]
    Lookup {
        type_name: String,
        #[source]
        source: StoreError,
    },
    /// Creation conflicted but the retried lookup still found nothing
    #[error("attribute type '{type_name}' conflicted on create but is not visible")]
    Vanished { type_name: String },
}

/// A single value could not be converted to its attribute kind.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoercionError {
    /// Null or absent value
    #[error("null value for {kind} field")]
    Null { kind: ValueKind },
    /// Value present but malformed for the kind
    #[error("cannot read '{value}' as {kind}")]
    Format { kind: ValueKind, value: String },
}

/// The batch for one source could not be delivered.
#[derive(Debug, Error)]
pub enum EmissionError {
    /// Store unreachable or rejected the post
    #[error("failed to post {artifacts} artifact(s) for '{source_item}': {source}")]
    Post {
        source_item: String,
        artifacts: usize,
        #[source]
        source: StoreError,
    },
    /// Merge-singleton lookup failed
    #[error("failed to look up existing '{kind}' artifact: {source}")]
    Lookup {
        kind: String,
        #[source]
        source: StoreError,
    },
}

/// Errors raised by a [`KnowledgeStore`](crate::store::KnowledgeStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another caller already created the named entry
    #[error("'{0}' already exists")]
    Conflict(String),
    /// Store cannot be reached (closed, poisoned or switched off)
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Name is not acceptable to the store
    #[error("invalid name '{0}'")]
    InvalidName(String),
    /// Referenced artifact does not exist
    #[error("unknown artifact {0}")]
    UnknownArtifact(i64),
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while reading a record source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Malformed property list document
    #[error("property list error: {0}")]
    Plist(String),
    /// Configured key path does not exist in the document
    #[error("key path '{0}' not found")]
    MissingKeyPath(String),
    /// One record could not be decoded; the stream can continue
    #[error("line {line}: {message}")]
    Record { line: u64, message: String },
}

impl SourceError {
    /// Whether the source can keep producing records after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SourceError::Record { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SourceError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while loading ingestion configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid type rule pattern '{pattern}': {source}")]
    Rule {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid namespace '{0}'")]
    Namespace(String),
    #[error("invalid date pattern '{pattern}': {reason}")]
    DatePattern { pattern: String, reason: String },
}

/// File-level failure returned by the engine.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Emission(#[from] EmissionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Job was canceled; callers stop processing further files
    #[error("ingestion canceled")]
    Canceled,
}

impl IngestError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, IngestError::Canceled)
    }

    /// Empty sources are "nothing to ingest" rather than a failure
    pub fn is_empty_source(&self) -> bool {
        matches!(self, IngestError::Schema(SchemaError::Empty { .. }))
    }
}
