//! Ingestion engine
//!
//! Drives one record source at a time through the pipeline:
//!
//! ```text
//! RecordSource ──► SchemaDiscoverer ──► RecordMapper ──► ArtifactEmitter ──► KnowledgeStore
//!                                           │
//!                                      RunRegistry (attribute types, per run)
//! ```
//!
//! Row and field failures are absorbed and counted in the [`RunSummary`].
//! File failures end that file only; cancellation ends the whole job.

pub mod coercion;
pub mod emitter;
pub mod mapper;
pub mod registry;
pub mod schema;
pub mod types;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::common::audit::{self, IngestAuditContext};
use crate::config::IngestConfig;
use crate::error::{ConfigError, IngestError, IngestResult, SourceResult};
use crate::sources::{find_tool_output_files, DelimitedSource, PlistSelection, PlistSource, RecordSource, SqliteSource};
use crate::store::KnowledgeStore;

use emitter::ArtifactEmitter;
use mapper::{MapOutcome, RecordMapper};
use registry::RunRegistry;
use schema::SchemaDiscoverer;
use types::{ArtifactKind, CancellationSource, SourceItem};

// =============================================================================
// Run results
// =============================================================================

/// Counters for one source
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub source: String,
    pub artifact_kind: String,
    pub fields: usize,
    pub records_seen: u64,
    pub mapped: u64,
    /// Skipped records by reason key
    pub skipped: BTreeMap<String, u64>,
    /// Recoverable read errors (e.g. undecodable rows)
    pub source_errors: u64,
    /// DATETIME values stored as 0 after a parse failure
    pub degraded_datetimes: u64,
    pub dropped_fields: Vec<String>,
    pub created: usize,
    pub merged: usize,
}

impl RunSummary {
    pub fn skipped_total(&self) -> u64 {
        self.skipped.values().sum()
    }
}

/// Result for one file of a multi-file job
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    Ingested(RunSummary),
    /// Source had no fields
    Empty { source: String },
    Failed { source: String, error: String },
    /// Job was canceled while this file was in progress
    Canceled { source: String },
}

impl FileOutcome {
    pub fn source(&self) -> &str {
        match self {
            FileOutcome::Ingested(summary) => &summary.source,
            FileOutcome::Empty { source }
            | FileOutcome::Failed { source, .. }
            | FileOutcome::Canceled { source } => source,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, FileOutcome::Failed { .. })
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// How to open a source
#[derive(Debug, Clone, PartialEq)]
pub enum SourceSpec {
    Delimited(PathBuf),
    Plist { path: PathBuf, selection: PlistSelection },
    Sqlite { path: PathBuf, query: String },
}

impl SourceSpec {
    pub fn path(&self) -> &Path {
        match self {
            SourceSpec::Delimited(path) | SourceSpec::Plist { path, .. } | SourceSpec::Sqlite { path, .. } => path,
        }
    }

    pub fn open(&self) -> SourceResult<Box<dyn RecordSource>> {
        Ok(match self {
            SourceSpec::Delimited(path) => Box::new(DelimitedSource::open(path)?),
            SourceSpec::Plist { path, selection } => Box::new(PlistSource::open(path, selection)?),
            SourceSpec::Sqlite { path, query } => Box::new(SqliteSource::open(path, query)?),
        })
    }
}

/// One source and the artifact kind its records become
#[derive(Debug, Clone, PartialEq)]
pub struct IngestJob {
    pub spec: SourceSpec,
    pub kind: ArtifactKind,
    /// Item to attribute artifacts to instead of the file itself
    pub source_item: Option<SourceItem>,
}

impl IngestJob {
    pub fn new(spec: SourceSpec, kind: ArtifactKind) -> Self {
        Self {
            spec,
            kind,
            source_item: None,
        }
    }

    pub fn attributed_to(mut self, item: SourceItem) -> Self {
        self.source_item = Some(item);
        self
    }
}

/// One job per tool output file under `dir`, each with its own `<PREFIX>_<STEM>` kind
pub fn tool_output_jobs(dir: &Path, prefix: &str) -> SourceResult<Vec<IngestJob>> {
    let files = find_tool_output_files(dir)?;
    debug!(dir = %dir.display(), files = files.len(), "Found tool output files");
    Ok(files
        .into_iter()
        .map(|path| {
            let kind = ArtifactKind::for_output(prefix, &path);
            IngestJob::new(SourceSpec::Delimited(path), kind)
        })
        .collect())
}

// =============================================================================
// Engine
// =============================================================================

pub struct IngestEngine<'a> {
    store: &'a dyn KnowledgeStore,
    config: IngestConfig,
    discoverer: SchemaDiscoverer,
    cancel: &'a dyn CancellationSource,
}

impl<'a> IngestEngine<'a> {
    pub fn new(
        store: &'a dyn KnowledgeStore,
        config: IngestConfig,
        cancel: &'a dyn CancellationSource,
    ) -> Result<Self, ConfigError> {
        let discoverer = SchemaDiscoverer::new(&config)?;
        Ok(Self {
            store,
            config,
            discoverer,
            cancel,
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Ingest every record of one source as artifacts of `kind`
    ///
    /// All artifacts for the source are posted in a single batch at the end.
    pub fn ingest_source(&self, source: &mut dyn RecordSource, kind: ArtifactKind) -> IngestResult<RunSummary> {
        let item = source.source_item().clone();
        self.ingest_as(source, kind, item)
    }

    /// Like [`ingest_source`](Self::ingest_source), attributing artifacts to `item`
    pub fn ingest_as(
        &self,
        source: &mut dyn RecordSource,
        kind: ArtifactKind,
        item: SourceItem,
    ) -> IngestResult<RunSummary> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let audit_ctx = IngestAuditContext::new(&run_id, &item.id);
        audit::log_source_opened(Path::new(&item.id), source.format(), source.fields().len());

        let schema = self.discoverer.discover(source.name(), source.fields())?;
        let mut registry = RunRegistry::new(self.store, self.config.namespace.clone());
        let mapper = RecordMapper::new(&schema, &self.config.module_name);
        let policy = self.config.policy_for(&kind.name);
        let mut emitter = ArtifactEmitter::new(self.store, kind.clone(), policy, item.clone(), &self.config.module_name);

        let mut summary = RunSummary {
            run_id,
            source: item.id.clone(),
            artifact_kind: kind.name.clone(),
            fields: schema.len(),
            ..RunSummary::default()
        };

        let interval = self.config.cancel_interval() as u64;
        loop {
            if summary.records_seen % interval == 0 && self.cancel.is_canceled() {
                break;
            }
            let record = match source.next_record() {
                None => break,
                Some(Ok(record)) => record,
                Some(Err(e)) if e.is_recoverable() => {
                    warn!(source = %item.name, error = %e, "Skipping unreadable record");
                    summary.source_errors += 1;
                    continue;
                }
                Some(Err(e)) => {
                    error!(source = %item.name, error = %e, "Source failed");
                    return Err(e.into());
                }
            };
            summary.records_seen += 1;

            match mapper.map(&mut registry, &record) {
                MapOutcome::Mapped(mapped) => {
                    summary.mapped += 1;
                    summary.degraded_datetimes += mapped.degraded as u64;
                    emitter.add(mapped.attributes)?;
                }
                MapOutcome::Skipped(reason) => {
                    *summary.skipped.entry(reason.key().to_string()).or_default() += 1;
                }
            }
        }

        summary.dropped_fields = registry.dropped_fields().iter().map(|f| f.to_string()).collect();
        let report = emitter.finish(self.cancel)?;
        summary.created = report.created;
        summary.merged = report.merged;

        audit_ctx.log_operation(
            "ingest_complete",
            &format!(
                "mapped={} skipped={} created={} merged={}",
                summary.mapped,
                summary.skipped_total(),
                summary.created,
                summary.merged
            ),
        );
        info!(
            source = %item.name,
            kind = %kind.name,
            records = summary.records_seen,
            mapped = summary.mapped,
            skipped = summary.skipped_total(),
            degraded = summary.degraded_datetimes,
            "Source ingested"
        );
        Ok(summary)
    }

    /// Open and ingest one job
    pub fn run_job(&self, job: &IngestJob) -> IngestResult<RunSummary> {
        let mut source = job.spec.open()?;
        match &job.source_item {
            Some(item) => self.ingest_as(source.as_mut(), job.kind.clone(), item.clone()),
            None => self.ingest_source(source.as_mut(), job.kind.clone()),
        }
    }

    /// Ingest jobs in order, continuing past file failures and stopping on cancel
    pub fn ingest_all<I>(&self, jobs: I) -> Vec<FileOutcome>
    where
        I: IntoIterator<Item = IngestJob>,
    {
        let mut outcomes = Vec::new();
        for job in jobs {
            let source = job.spec.path().display().to_string();
            match self.run_job(&job) {
                Ok(summary) => outcomes.push(FileOutcome::Ingested(summary)),
                Err(e) if e.is_empty_source() => {
                    info!(source = %source, "Nothing to ingest");
                    outcomes.push(FileOutcome::Empty { source });
                }
                Err(IngestError::Canceled) => {
                    warn!(source = %source, "Ingestion canceled; remaining files skipped");
                    outcomes.push(FileOutcome::Canceled { source });
                    break;
                }
                Err(e) => {
                    error!(source = %source, error = %e, "File ingestion failed");
                    outcomes.push(FileOutcome::Failed {
                        source,
                        error: e.to_string(),
                    });
                }
            }
        }
        outcomes
    }
}
