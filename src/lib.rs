//! FFX Ingest - forensic tool-output ingestion and dynamic schema mapping
//!
//! Reads tabular and semi-structured output (CSV/TSV, property lists, SQLite
//! databases), discovers its fields at runtime, registers one attribute type
//! per field and posts the typed records to a case knowledge store as
//! artifacts.

pub mod common;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod sources;
pub mod store;

pub use config::IngestConfig;
pub use engine::types::{ArtifactKind, CancellationToken, EmissionPolicy, NeverCancel, SourceItem, ValueKind};
pub use engine::{tool_output_jobs, FileOutcome, IngestEngine, IngestJob, RunSummary, SourceSpec};
pub use error::{IngestError, IngestResult};
pub use store::{InMemoryStore, KnowledgeStore, SqliteStore};
