//! Attribute type registry
//!
//! Resolves a field to its persistent attribute type, creating the type on
//! first use. Creation is idempotent: when the store reports a conflict
//! (another run created the type between our lookup and create), the lookup
//! is retried once and the existing handle is returned.

use std::collections::{HashMap, HashSet};

use tracing::{debug, error, warn};

use super::types::{AttributeTypeHandle, FieldName, Namespace, ValueKind};
use crate::common::audit;
use crate::error::{RegistryError, StoreError};
use crate::store::KnowledgeStore;

/// Look up `<namespace>_<field>`, creating it on a miss
pub fn get_or_create(
    store: &dyn KnowledgeStore,
    namespace: &Namespace,
    field: &FieldName,
    kind: ValueKind,
    display_label: &str,
) -> Result<AttributeTypeHandle, RegistryError> {
    let type_name = namespace.qualify(field);
    let lookup = |type_name: &str| {
        store
            .lookup_attribute_type(type_name)
            .map_err(|source| RegistryError::Lookup {
                type_name: type_name.to_string(),
                source,
            })
    };

    if let Some(handle) = lookup(&type_name)? {
        return Ok(handle);
    }

    match store.create_attribute_type(&type_name, kind, display_label) {
        Ok(handle) => {
            audit::log_attribute_type_created(&type_name, kind);
            Ok(handle)
        }
        Err(StoreError::Conflict(_)) => {
            debug!(type_name = %type_name, "Attribute type created concurrently, retrying lookup");
            lookup(&type_name)?.ok_or(RegistryError::Vanished { type_name })
        }
        Err(source) => Err(RegistryError::Create { type_name, source }),
    }
}

/// Per-run cache of resolved attribute types
///
/// A field whose type cannot be resolved is remembered as dropped and skipped
/// for the rest of the run without further store calls.
pub struct RunRegistry<'a> {
    store: &'a dyn KnowledgeStore,
    namespace: Namespace,
    handles: HashMap<FieldName, AttributeTypeHandle>,
    dropped: HashSet<FieldName>,
}

impl<'a> RunRegistry<'a> {
    pub fn new(store: &'a dyn KnowledgeStore, namespace: Namespace) -> Self {
        Self {
            store,
            namespace,
            handles: HashMap::new(),
            dropped: HashSet::new(),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Handle for a field, or `None` if the field has been dropped
    pub fn resolve(&mut self, field: &FieldName, kind: ValueKind, label: &str) -> Option<AttributeTypeHandle> {
        if let Some(handle) = self.handles.get(field) {
            return Some(handle.clone());
        }
        if self.dropped.contains(field) {
            return None;
        }

        match get_or_create(self.store, &self.namespace, field, kind, label) {
            Ok(handle) => {
                if handle.kind() != kind {
                    warn!(
                        field = %field,
                        stored = %handle.kind(),
                        discovered = %kind,
                        "Attribute type exists with a different kind; using stored kind"
                    );
                }
                self.handles.insert(field.clone(), handle.clone());
                Some(handle)
            }
            Err(e) => {
                error!(field = %field, error = %e, "Dropping field for the rest of the run");
                self.dropped.insert(field.clone());
                None
            }
        }
    }

    pub fn is_dropped(&self, field: &FieldName) -> bool {
        self.dropped.contains(field)
    }

    pub fn dropped_fields(&self) -> Vec<FieldName> {
        let mut fields: Vec<_> = self.dropped.iter().cloned().collect();
        fields.sort();
        fields
    }

    pub fn cached(&self) -> usize {
        self.handles.len()
    }
}
