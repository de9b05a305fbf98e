//! In-memory knowledge store
//!
//! Lookup and creation take the lock separately, so two callers can both miss
//! and race to create the same attribute type. The loser gets
//! [`StoreError::Conflict`], exactly as with the SQLite store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tracing::debug;

use super::{validate_type_name, KnowledgeStore};
use crate::engine::types::{
    ArtifactBatch, ArtifactKind, ArtifactRef, AttributeTypeHandle, SourceItem, TypedAttribute, ValueKind,
};
use crate::error::{StoreError, StoreResult};

/// Artifact as held by the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredArtifact {
    pub id: i64,
    pub kind: String,
    pub source: SourceItem,
    pub module_name: String,
    pub attributes: Vec<TypedAttribute>,
}

impl StoredArtifact {
    /// First value for an attribute type name
    pub fn value(&self, type_name: &str) -> Option<&TypedAttribute> {
        self.attributes
            .iter()
            .find(|a| a.attribute_type.type_name() == type_name)
    }
}

#[derive(Default)]
struct Inner {
    attribute_types: BTreeMap<String, AttributeTypeHandle>,
    artifact_kinds: BTreeMap<String, ArtifactKind>,
    artifacts: Vec<StoredArtifact>,
    next_type_id: i64,
    posts: usize,
}

pub struct InMemoryStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away; every call fails with `Unavailable`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }

    pub fn attribute_types(&self) -> StoreResult<Vec<AttributeTypeHandle>> {
        Ok(self.lock()?.attribute_types.values().cloned().collect())
    }

    pub fn artifact_kinds(&self) -> StoreResult<Vec<ArtifactKind>> {
        Ok(self.lock()?.artifact_kinds.values().cloned().collect())
    }

    pub fn artifacts(&self) -> StoreResult<Vec<StoredArtifact>> {
        Ok(self.lock()?.artifacts.clone())
    }

    /// Number of successful `post_artifacts` calls
    pub fn post_count(&self) -> StoreResult<usize> {
        Ok(self.lock()?.posts)
    }
}

impl KnowledgeStore for InMemoryStore {
    fn lookup_attribute_type(&self, type_name: &str) -> StoreResult<Option<AttributeTypeHandle>> {
        Ok(self.lock()?.attribute_types.get(type_name).cloned())
    }

    fn create_attribute_type(
        &self,
        type_name: &str,
        kind: ValueKind,
        display_name: &str,
    ) -> StoreResult<AttributeTypeHandle> {
        validate_type_name(type_name)?;
        let mut inner = self.lock()?;
        if inner.attribute_types.contains_key(type_name) {
            return Err(StoreError::Conflict(type_name.to_string()));
        }
        inner.next_type_id += 1;
        let handle = AttributeTypeHandle::new(inner.next_type_id, type_name, kind, display_name);
        inner.attribute_types.insert(type_name.to_string(), handle.clone());
        debug!(type_name, kind = %kind, "Created attribute type");
        Ok(handle)
    }

    fn post_artifacts(&self, batch: ArtifactBatch) -> StoreResult<Vec<ArtifactRef>> {
        let mut inner = self.lock()?;

        // Validate merge targets before touching anything
        for merge in &batch.merges {
            let id = merge.target.id;
            if !inner.artifacts.iter().any(|a| a.id == id) {
                return Err(StoreError::UnknownArtifact(id));
            }
        }

        for merge in batch.merges {
            if let Some(existing) = inner.artifacts.iter_mut().find(|a| a.id == merge.target.id) {
                existing.attributes.extend(merge.attributes);
            }
        }

        let mut refs = Vec::with_capacity(batch.new_artifacts.len());
        for artifact in batch.new_artifacts {
            let id = inner.artifacts.len() as i64 + 1;
            refs.push(ArtifactRef {
                id,
                kind: artifact.kind.name.clone(),
                source_id: artifact.source.id.clone(),
            });
            inner.artifacts.push(StoredArtifact {
                id,
                kind: artifact.kind.name,
                source: artifact.source,
                module_name: batch.module_name.clone(),
                attributes: artifact.attributes,
            });
        }
        inner.posts += 1;
        Ok(refs)
    }

    fn find_existing_artifact(&self, kind: &str, source: &SourceItem) -> StoreResult<Option<ArtifactRef>> {
        let inner = self.lock()?;
        Ok(inner
            .artifacts
            .iter()
            .find(|a| a.kind == kind && a.source.id == source.id)
            .map(|a| ArtifactRef {
                id: a.id,
                kind: a.kind.clone(),
                source_id: a.source.id.clone(),
            }))
    }

    fn get_or_add_artifact_kind(&self, kind: &ArtifactKind) -> StoreResult<()> {
        validate_type_name(&kind.name)?;
        let mut inner = self.lock()?;
        inner
            .artifact_kinds
            .entry(kind.name.clone())
            .or_insert_with(|| kind.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{Artifact, ArtifactMerge, CoercedValue};

    fn attr(handle: &AttributeTypeHandle, value: &str) -> TypedAttribute {
        TypedAttribute {
            attribute_type: handle.clone(),
            namespace: "test".into(),
            value: CoercedValue::String(value.into()),
        }
    }

    #[test]
    fn test_create_conflict() {
        let store = InMemoryStore::new();
        store.create_attribute_type("CS_ID", ValueKind::Integer, "ID").unwrap();
        let err = store.create_attribute_type("CS_ID", ValueKind::Integer, "ID").unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn test_post_and_find() {
        let store = InMemoryStore::new();
        let handle = store.create_attribute_type("RA_NAME", ValueKind::String, "Name").unwrap();
        let source = SourceItem::new("/a/SystemVersion.plist", "SystemVersion.plist");
        let batch = ArtifactBatch {
            module_name: "test".into(),
            new_artifacts: vec![Artifact {
                kind: ArtifactKind::new("TSK_OS_INFO", "OS Info"),
                source: source.clone(),
                attributes: vec![attr(&handle, "macOS")],
            }],
            merges: vec![],
        };
        let refs = store.post_artifacts(batch).unwrap();
        assert_eq!(refs.len(), 1);

        let found = store.find_existing_artifact("TSK_OS_INFO", &source).unwrap().unwrap();
        assert_eq!(found.id, refs[0].id);
        assert!(store.find_existing_artifact("CS_OTHER", &source).unwrap().is_none());
    }

    #[test]
    fn test_merge_into_unknown_artifact_rejected() {
        let store = InMemoryStore::new();
        let handle = store.create_attribute_type("RA_NAME", ValueKind::String, "Name").unwrap();
        let batch = ArtifactBatch {
            module_name: "test".into(),
            new_artifacts: vec![],
            merges: vec![ArtifactMerge {
                target: ArtifactRef {
                    id: 42,
                    kind: "TSK_OS_INFO".into(),
                    source_id: "x".into(),
                },
                attributes: vec![attr(&handle, "v")],
            }],
        };
        assert!(matches!(store.post_artifacts(batch), Err(StoreError::UnknownArtifact(42))));
        assert_eq!(store.post_count().unwrap(), 0);
    }

    #[test]
    fn test_unavailable_store() {
        let store = InMemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.lookup_attribute_type("CS_ID"),
            Err(StoreError::Unavailable(_))
        ));
        store.set_available(true);
        assert!(store.lookup_attribute_type("CS_ID").unwrap().is_none());
    }
}
