//! Forensic Audit Logging
//!
//! Structured chain-of-custody events for ingestion: which sources were read,
//! which attribute types were created and which batches reached the case
//! database. All events go to the `forensic_audit` target with timestamps.

use std::path::Path;
use tracing::{info, span, warn, Level};

use crate::engine::types::ValueKind;

/// Log a record source being opened for ingestion
pub fn log_source_opened(path: &Path, format: &str, fields: usize) {
    let _span = span!(
        Level::INFO,
        "source_open",
        path = %path.display(),
    )
    .entered();

    info!(
        target: "forensic_audit",
        operation = "source_open",
        path = %path.display(),
        format = format,
        fields = fields,
        timestamp = %chrono::Utc::now().to_rfc3339(),
        "Record source opened"
    );
}

/// Log creation of a new persistent attribute type
pub fn log_attribute_type_created(type_name: &str, kind: ValueKind) {
    info!(
        target: "forensic_audit",
        operation = "attribute_type_created",
        type_name = type_name,
        kind = kind.as_str(),
        timestamp = %chrono::Utc::now().to_rfc3339(),
        "Attribute type created"
    );
}

/// Log a batch reaching the knowledge store
pub fn log_batch_posted(source_item: &str, artifact_kind: &str, created: usize, merged: usize) {
    info!(
        target: "forensic_audit",
        operation = "batch_posted",
        source_item = source_item,
        artifact_kind = artifact_kind,
        created = created,
        merged = merged,
        timestamp = %chrono::Utc::now().to_rfc3339(),
        "Artifact batch posted"
    );
}

/// Log a batch dropped because the job was canceled
pub fn log_batch_discarded(source_item: &str, artifact_kind: &str, pending: usize) {
    warn!(
        target: "forensic_audit",
        operation = "batch_discarded",
        source_item = source_item,
        artifact_kind = artifact_kind,
        pending = pending,
        timestamp = %chrono::Utc::now().to_rfc3339(),
        "Artifact batch discarded on cancel"
    );
}

/// Audit context for one ingestion run
///
/// Logs run start on creation and run end (with duration) on drop.
pub struct IngestAuditContext {
    pub run_id: String,
    pub source: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl IngestAuditContext {
    pub fn new(run_id: impl Into<String>, source: impl Into<String>) -> Self {
        let ctx = Self {
            run_id: run_id.into(),
            source: source.into(),
            started_at: chrono::Utc::now(),
        };

        info!(
            target: "forensic_audit",
            operation = "run_start",
            run_id = %ctx.run_id,
            source = %ctx.source,
            timestamp = %ctx.started_at.to_rfc3339(),
            "Ingestion run started"
        );

        ctx
    }

    pub fn log_operation(&self, operation: &str, details: &str) {
        info!(
            target: "forensic_audit",
            run_id = %self.run_id,
            operation = operation,
            details = details,
            timestamp = %chrono::Utc::now().to_rfc3339(),
            "Ingestion operation"
        );
    }
}

impl Drop for IngestAuditContext {
    fn drop(&mut self) {
        let duration = chrono::Utc::now() - self.started_at;
        info!(
            target: "forensic_audit",
            operation = "run_end",
            run_id = %self.run_id,
            source = %self.source,
            duration_ms = duration.num_milliseconds(),
            timestamp = %chrono::Utc::now().to_rfc3339(),
            "Ingestion run ended"
        );
    }
}
