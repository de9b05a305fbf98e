//! Knowledge store contract
//!
//! The engine needs only a narrow slice of the case database: attribute type
//! lookup and creation, artifact-kind registration, singleton artifact lookup,
//! and one batch post per source.
//!
//! Implementations:
//! - [`InMemoryStore`] - mutex-guarded maps, used for dry runs and tests
//! - [`SqliteStore`] - persistent case database

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::engine::types::{ArtifactBatch, ArtifactKind, ArtifactRef, AttributeTypeHandle, SourceItem, ValueKind};
use crate::error::{StoreError, StoreResult};

/// Narrow read/write contract the mapping engine needs from the case database
///
/// `create_attribute_type` must return [`StoreError::Conflict`] when the name
/// already exists; callers rely on that to resolve concurrent creation.
pub trait KnowledgeStore: Send + Sync {
    fn lookup_attribute_type(&self, type_name: &str) -> StoreResult<Option<AttributeTypeHandle>>;

    fn create_attribute_type(
        &self,
        type_name: &str,
        kind: ValueKind,
        display_name: &str,
    ) -> StoreResult<AttributeTypeHandle>;

    /// Persist a batch atomically; returns references to the new artifacts
    fn post_artifacts(&self, batch: ArtifactBatch) -> StoreResult<Vec<ArtifactRef>>;

    fn find_existing_artifact(&self, kind: &str, source: &SourceItem) -> StoreResult<Option<ArtifactRef>>;

    /// Register an artifact kind if it is not known yet
    fn get_or_add_artifact_kind(&self, kind: &ArtifactKind) -> StoreResult<()> {
        validate_type_name(&kind.name)
    }
}

/// Attribute type and artifact kind names must be non-empty and printable
pub fn validate_type_name(name: &str) -> StoreResult<()> {
    if name.trim().is_empty() || name.chars().any(|c| c.is_control()) {
        return Err(StoreError::InvalidName(name.escape_debug().to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_type_name() {
        assert!(validate_type_name("CS_ID").is_ok());
        assert!(validate_type_name("  ").is_err());
        assert!(validate_type_name("CS_\u{7}").is_err());
    }
}
