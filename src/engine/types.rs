//! Core types shared by the mapping engine, record sources and stores

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// =============================================================================
// Field Names and Kinds
// =============================================================================

/// Normalized (trimmed, upper-cased) field name discovered in a record source
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldName(String);

impl FieldName {
    pub fn new(raw: &str) -> Self {
        FieldName(raw.trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value kind of a persistent attribute type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    #[serde(rename = "STRING")]
    String,
    #[serde(rename = "INTEGER")]
    Integer,
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "DOUBLE")]
    Double,
    #[serde(rename = "DATETIME")]
    DateTime,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::String => "STRING",
            ValueKind::Integer => "INTEGER",
            ValueKind::Long => "LONG",
            ValueKind::Double => "DOUBLE",
            ValueKind::DateTime => "DATETIME",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "STRING" => Some(ValueKind::String),
            "INTEGER" => Some(ValueKind::Integer),
            "LONG" => Some(ValueKind::Long),
            "DOUBLE" => Some(ValueKind::Double),
            "DATETIME" => Some(ValueKind::DateTime),
            _ => None,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prefix qualifying attribute type names (e.g. `CS` gives `CS_ID`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace(String);

impl Namespace {
    pub fn new(prefix: &str) -> Result<Self, ConfigError> {
        let prefix = prefix.trim().to_uppercase();
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ConfigError::Namespace(prefix));
        }
        Ok(Namespace(prefix))
    }

    /// Built-in prefixes, already upper-case and valid
    pub(crate) fn known(prefix: &'static str) -> Self {
        Namespace(prefix.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fully-qualified attribute type name for a field
    pub fn qualify(&self, field: &FieldName) -> String {
        format!("{}_{}", self.0, field.as_str())
    }
}

impl TryFrom<String> for Namespace {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Namespace::new(&value)
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Attribute Types
// =============================================================================

/// Reference to a persistent attribute type definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeTypeHandle {
    id: i64,
    type_name: String,
    kind: ValueKind,
    display_name: String,
}

impl AttributeTypeHandle {
    pub fn new(id: i64, type_name: impl Into<String>, kind: ValueKind, display_name: impl Into<String>) -> Self {
        Self {
            id,
            type_name: type_name.into(),
            kind,
            display_name: display_name.into(),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

// =============================================================================
// Raw and Coerced Values
// =============================================================================

/// A value as produced by a record source, before coercion
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Date(DateTime<Utc>),
}

impl RawValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }

    /// Short rendering for log lines
    pub fn preview(&self) -> String {
        match self {
            RawValue::Null => "<null>".to_string(),
            RawValue::Text(s) => s.chars().take(64).collect(),
            RawValue::Integer(n) => n.to_string(),
            RawValue::Real(f) => f.to_string(),
            RawValue::Bool(b) => b.to_string(),
            RawValue::Bytes(b) => format!("<{} bytes>", b.len()),
            RawValue::Date(d) => d.to_rfc3339(),
        }
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Text(s.to_string())
    }
}

impl From<String> for RawValue {
    fn from(s: String) -> Self {
        RawValue::Text(s)
    }
}

impl From<i64> for RawValue {
    fn from(n: i64) -> Self {
        RawValue::Integer(n)
    }
}

impl From<f64> for RawValue {
    fn from(f: f64) -> Self {
        RawValue::Real(f)
    }
}

/// One record read from a source
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// 1-based position in the source (CSV line, array index + 1, SQL row)
    pub line: u64,
    pub values: Vec<RawValue>,
}

impl RawRecord {
    pub fn new(line: u64, values: Vec<RawValue>) -> Self {
        Self { line, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A value after coercion to its attribute kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CoercedValue {
    String(String),
    Int64(i64),
    Float64(f64),
    /// Seconds since 1970-01-01T00:00:00Z
    EpochSeconds(i64),
}

impl CoercedValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CoercedValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CoercedValue::Int64(n) | CoercedValue::EpochSeconds(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for CoercedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoercedValue::String(s) => f.write_str(s),
            CoercedValue::Int64(n) | CoercedValue::EpochSeconds(n) => write!(f, "{}", n),
            CoercedValue::Float64(v) => write!(f, "{}", v),
        }
    }
}

/// Coerced value bound to its attribute type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedAttribute {
    pub attribute_type: AttributeTypeHandle,
    /// Module that produced the value
    pub namespace: String,
    pub value: CoercedValue,
}

// =============================================================================
// Artifacts
// =============================================================================

/// Artifact kind tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKind {
    pub name: String,
    pub display_name: String,
}

impl ArtifactKind {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
        }
    }

    /// Kind named after a tool output file: `<PREFIX>_<STEM>`, displayed with spaces
    pub fn for_output(prefix: &str, path: &Path) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = format!("{}_{}", prefix.to_uppercase(), stem.to_uppercase());
        let display_name = name.replace('_', " ");
        Self { name, display_name }
    }
}

/// The item a set of artifacts was derived from (usually a file)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceItem {
    /// Stable identifier (path or object id) used for singleton matching
    pub id: String,
    pub name: String,
}

impl SourceItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Self::new(path.display().to_string(), name)
    }
}

/// A new artifact and its attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub source: SourceItem,
    pub attributes: Vec<TypedAttribute>,
}

/// Reference to an artifact already held by the store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: i64,
    pub kind: String,
    pub source_id: String,
}

/// Attributes to attach to an existing artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMerge {
    pub target: ArtifactRef,
    pub attributes: Vec<TypedAttribute>,
}

/// Everything one source contributes, posted in a single store call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactBatch {
    pub module_name: String,
    pub new_artifacts: Vec<Artifact>,
    pub merges: Vec<ArtifactMerge>,
}

impl ArtifactBatch {
    pub fn is_empty(&self) -> bool {
        self.new_artifacts.is_empty() && self.merges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.new_artifacts.len() + self.merges.len()
    }
}

/// How accepted records become artifacts for one kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmissionPolicy {
    /// One new artifact per accepted record
    #[default]
    CreateNew,
    /// Attach to the artifact of this kind already on the source item, if any
    MergeSingleton,
}

// =============================================================================
// Cancellation
// =============================================================================

/// Cooperative job cancellation
pub trait CancellationSource: Send + Sync {
    fn is_canceled(&self) -> bool;
}

/// Shared cancel flag; clones observe the same state
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl CancellationSource for CancellationToken {
    fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cancellation source for runs that cannot be canceled
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCancel;

impl CancellationSource for NeverCancel {
    fn is_canceled(&self) -> bool {
        false
    }
}
