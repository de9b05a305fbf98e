//! Artifact batch emission
//!
//! Accumulates mapped records for one source item and posts them in a single
//! store call. Nothing reaches the store before [`ArtifactEmitter::finish`],
//! so a canceled or failed run never leaves a partial artifact behind.

use tracing::debug;

use super::types::{
    Artifact, ArtifactBatch, ArtifactKind, ArtifactMerge, ArtifactRef, CancellationSource, EmissionPolicy,
    SourceItem, TypedAttribute,
};
use crate::common::audit;
use crate::error::{EmissionError, IngestError, IngestResult};
use crate::store::KnowledgeStore;

/// Where merge-singleton attributes go
#[derive(Debug)]
enum Singleton {
    /// New artifact created earlier in this run (index into `new_artifacts`)
    Pending(usize),
    /// Artifact already in the store
    Existing(ArtifactMerge),
}

/// What happened to one accepted record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitAction {
    Created,
    Merged,
}

/// Outcome of posting one source's batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmitReport {
    /// False for empty batches
    pub posted: bool,
    pub created: usize,
    /// Existing artifacts that received attributes
    pub merged: usize,
    pub artifacts: Vec<ArtifactRef>,
}

pub struct ArtifactEmitter<'a> {
    store: &'a dyn KnowledgeStore,
    kind: ArtifactKind,
    policy: EmissionPolicy,
    source: SourceItem,
    module_name: String,
    new_artifacts: Vec<Artifact>,
    singleton: Option<Singleton>,
}

impl<'a> ArtifactEmitter<'a> {
    pub fn new(
        store: &'a dyn KnowledgeStore,
        kind: ArtifactKind,
        policy: EmissionPolicy,
        source: SourceItem,
        module_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            kind,
            policy,
            source,
            module_name: module_name.into(),
            new_artifacts: Vec::new(),
            singleton: None,
        }
    }

    pub fn kind(&self) -> &ArtifactKind {
        &self.kind
    }

    pub fn pending(&self) -> usize {
        self.new_artifacts.len() + usize::from(matches!(self.singleton, Some(Singleton::Existing(_))))
    }

    /// Queue one record's attributes
    pub fn add(&mut self, attributes: Vec<TypedAttribute>) -> Result<EmitAction, EmissionError> {
        if self.policy == EmissionPolicy::CreateNew {
            self.push_new(attributes);
            return Ok(EmitAction::Created);
        }

        match &mut self.singleton {
            Some(Singleton::Pending(idx)) => {
                self.new_artifacts[*idx].attributes.extend(attributes);
                Ok(EmitAction::Merged)
            }
            Some(Singleton::Existing(merge)) => {
                merge.attributes.extend(attributes);
                Ok(EmitAction::Merged)
            }
            None => {
                let existing = self
                    .store
                    .find_existing_artifact(&self.kind.name, &self.source)
                    .map_err(|source| EmissionError::Lookup {
                        kind: self.kind.name.clone(),
                        source,
                    })?;
                match existing {
                    Some(target) => {
                        debug!(kind = %self.kind.name, artifact = target.id, "Merging into existing artifact");
                        self.singleton = Some(Singleton::Existing(ArtifactMerge { target, attributes }));
                        Ok(EmitAction::Merged)
                    }
                    None => {
                        self.push_new(attributes);
                        self.singleton = Some(Singleton::Pending(self.new_artifacts.len() - 1));
                        Ok(EmitAction::Created)
                    }
                }
            }
        }
    }

    fn push_new(&mut self, attributes: Vec<TypedAttribute>) {
        self.new_artifacts.push(Artifact {
            kind: self.kind.clone(),
            source: self.source.clone(),
            attributes,
        });
    }

    /// Post everything queued, checking cancellation first
    ///
    /// A canceled run discards the batch and returns [`IngestError::Canceled`]
    /// even when the batch is empty.
    pub fn finish(self, cancel: &dyn CancellationSource) -> IngestResult<EmitReport> {
        let batch = ArtifactBatch {
            module_name: self.module_name,
            new_artifacts: self.new_artifacts,
            merges: match self.singleton {
                Some(Singleton::Existing(merge)) => vec![merge],
                _ => Vec::new(),
            },
        };

        if cancel.is_canceled() {
            audit::log_batch_discarded(&self.source.id, &self.kind.name, batch.len());
            return Err(IngestError::Canceled);
        }
        if batch.is_empty() {
            debug!(source = %self.source.id, kind = %self.kind.name, "Nothing to post");
            return Ok(EmitReport::default());
        }

        let created = batch.new_artifacts.len();
        let merged = batch.merges.len();
        let count = batch.len();
        let post_error = |source| EmissionError::Post {
            source_item: self.source.id.clone(),
            artifacts: count,
            source,
        };

        self.store.get_or_add_artifact_kind(&self.kind).map_err(post_error)?;
        let artifacts = self.store.post_artifacts(batch).map_err(post_error)?;
        audit::log_batch_posted(&self.source.id, &self.kind.name, created, merged);

        Ok(EmitReport {
            posted: true,
            created,
            merged,
            artifacts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{AttributeTypeHandle, CancellationToken, CoercedValue, NeverCancel, ValueKind};
    use crate::store::InMemoryStore;

    fn attrs(handle: &AttributeTypeHandle, value: &str) -> Vec<TypedAttribute> {
        vec![TypedAttribute {
            attribute_type: handle.clone(),
            namespace: "test".into(),
            value: CoercedValue::String(value.into()),
        }]
    }

    fn setup() -> (InMemoryStore, AttributeTypeHandle) {
        let store = InMemoryStore::new();
        let handle = store.create_attribute_type("CS_NOTE", ValueKind::String, "NOTE").unwrap();
        (store, handle)
    }

    fn source() -> SourceItem {
        SourceItem::new("/out/events.csv", "events.csv")
    }

    #[test]
    fn test_create_new_posts_once() {
        let (store, handle) = setup();
        let mut emitter = ArtifactEmitter::new(
            &store,
            ArtifactKind::new("CS_EVENTS", "CS EVENTS"),
            EmissionPolicy::CreateNew,
            source(),
            "test",
        );
        emitter.add(attrs(&handle, "a")).unwrap();
        emitter.add(attrs(&handle, "b")).unwrap();
        assert_eq!(emitter.pending(), 2);

        let report = emitter.finish(&NeverCancel).unwrap();
        assert!(report.posted);
        assert_eq!(report.created, 2);
        assert_eq!(store.post_count().unwrap(), 1);
        assert_eq!(store.artifacts().unwrap().len(), 2);
        assert_eq!(store.artifact_kinds().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let (store, _) = setup();
        let emitter = ArtifactEmitter::new(
            &store,
            ArtifactKind::new("CS_EVENTS", "CS EVENTS"),
            EmissionPolicy::CreateNew,
            source(),
            "test",
        );
        let report = emitter.finish(&NeverCancel).unwrap();
        assert!(!report.posted);
        assert_eq!(store.post_count().unwrap(), 0);
    }

    #[test]
    fn test_canceled_empty_batch() {
        let (store, _) = setup();
        let emitter = ArtifactEmitter::new(
            &store,
            ArtifactKind::new("CS_EVENTS", "CS EVENTS"),
            EmissionPolicy::CreateNew,
            source(),
            "test",
        );
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(emitter.finish(&token), Err(IngestError::Canceled)));
    }

    #[test]
    fn test_canceled_batch_is_discarded() {
        let (store, handle) = setup();
        let mut emitter = ArtifactEmitter::new(
            &store,
            ArtifactKind::new("CS_EVENTS", "CS EVENTS"),
            EmissionPolicy::CreateNew,
            source(),
            "test",
        );
        emitter.add(attrs(&handle, "a")).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        assert!(emitter.finish(&token).unwrap_err().is_canceled());
        assert!(store.artifacts().unwrap().is_empty());
    }

    #[test]
    fn test_merge_singleton_within_run() {
        let (store, handle) = setup();
        let mut emitter = ArtifactEmitter::new(
            &store,
            ArtifactKind::new("TSK_OS_INFO", "OS Info"),
            EmissionPolicy::MergeSingleton,
            source(),
            "test",
        );
        assert_eq!(emitter.add(attrs(&handle, "a")).unwrap(), EmitAction::Created);
        assert_eq!(emitter.add(attrs(&handle, "b")).unwrap(), EmitAction::Merged);
        let report = emitter.finish(&NeverCancel).unwrap();
        assert_eq!(report.created, 1);

        let artifacts = store.artifacts().unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].attributes.len(), 2);
    }

    #[test]
    fn test_merge_singleton_into_stored_artifact() {
        let (store, handle) = setup();
        let kind = ArtifactKind::new("TSK_OS_INFO", "OS Info");
        let mut first = ArtifactEmitter::new(&store, kind.clone(), EmissionPolicy::MergeSingleton, source(), "test");
        first.add(attrs(&handle, "first")).unwrap();
        first.finish(&NeverCancel).unwrap();

        let mut second = ArtifactEmitter::new(&store, kind, EmissionPolicy::MergeSingleton, source(), "test");
        assert_eq!(second.add(attrs(&handle, "second")).unwrap(), EmitAction::Merged);
        let report = second.finish(&NeverCancel).unwrap();
        assert_eq!((report.created, report.merged), (0, 1));

        let artifacts = store.artifacts().unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].attributes.len(), 2);
    }

    #[test]
    fn test_post_failure_is_emission_error() {
        let (store, handle) = setup();
        let mut emitter = ArtifactEmitter::new(
            &store,
            ArtifactKind::new("CS_EVENTS", "CS EVENTS"),
            EmissionPolicy::CreateNew,
            source(),
            "test",
        );
        emitter.add(attrs(&handle, "a")).unwrap();
        store.set_available(false);
        assert!(matches!(
            emitter.finish(&NeverCancel),
            Err(IngestError::Emission(EmissionError::Post { artifacts: 1, .. }))
        ));
    }
}
