//! Record mapping
//!
//! Validates one raw record against the schema and turns it into typed
//! attributes. Failures stay local to the record: the caller gets
//! [`MapOutcome::Skipped`] and moves on to the next one.

use std::fmt;

use tracing::{debug, warn};

use super::coercion::coerce_field;
use super::registry::RunRegistry;
use super::schema::Schema;
use super::types::{FieldName, RawRecord, RawValue, TypedAttribute};
use crate::error::CoercionError;

/// Why a record produced no artifact
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Record length differs from the schema
    FieldCountMismatch { expected: usize, actual: usize },
    /// Blank line (a single empty value)
    Blank,
    /// A non-DATETIME field could not be coerced
    Coercion { field: FieldName, error: CoercionError },
    /// Every field was dropped by the registry
    NoAttributes,
}

impl SkipReason {
    /// Stable key used in run summaries
    pub fn key(&self) -> &'static str {
        match self {
            SkipReason::FieldCountMismatch { .. } => "field_count_mismatch",
            SkipReason::Blank => "blank",
            SkipReason::Coercion { error: CoercionError::Null { .. }, .. } => "null_value",
            SkipReason::Coercion { .. } => "coercion",
            SkipReason::NoAttributes => "no_attributes",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::FieldCountMismatch { expected, actual } => {
                write!(f, "expected {} fields, found {}", expected, actual)
            }
            SkipReason::Blank => f.write_str("blank record"),
            SkipReason::Coercion { field, error } => write!(f, "{}: {}", field, error),
            SkipReason::NoAttributes => f.write_str("no resolvable attributes"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    pub attributes: Vec<TypedAttribute>,
    /// DATETIME values replaced with 0
    pub degraded: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MapOutcome {
    Mapped(MappedRecord),
    Skipped(SkipReason),
}

pub struct RecordMapper<'s> {
    schema: &'s Schema,
    module_name: String,
}

impl<'s> RecordMapper<'s> {
    pub fn new(schema: &'s Schema, module_name: impl Into<String>) -> Self {
        Self {
            schema,
            module_name: module_name.into(),
        }
    }

    pub fn map(&self, registry: &mut RunRegistry<'_>, record: &RawRecord) -> MapOutcome {
        let source = self.schema.source_name();

        if self.schema.len() > 1 && record.len() == 1 && matches!(&record.values[0], RawValue::Text(s) if s.is_empty()) {
            debug!(source, line = record.line, "Skipping blank record");
            return MapOutcome::Skipped(SkipReason::Blank);
        }

        if record.len() != self.schema.len() {
            let reason = SkipReason::FieldCountMismatch {
                expected: self.schema.len(),
                actual: record.len(),
            };
            warn!(source, line = record.line, "Skipping record: {}", reason);
            return MapOutcome::Skipped(reason);
        }

        let mut attributes = Vec::with_capacity(self.schema.len());
        let mut degraded = 0;
        for field in self.schema.fields() {
            let Some(handle) = registry.resolve(&field.name, field.kind, &field.label) else {
                continue;
            };
            let raw = &record.values[field.index];
            match coerce_field(&field.name, handle.kind(), raw, field.epoch.as_ref()) {
                Ok(coercion) => {
                    if coercion.degraded {
                        degraded += 1;
                    }
                    attributes.push(TypedAttribute {
                        attribute_type: handle,
                        namespace: self.module_name.clone(),
                        value: coercion.value,
                    });
                }
                Err(error) => {
                    let reason = SkipReason::Coercion {
                        field: field.name.clone(),
                        error,
                    };
                    warn!(source, line = record.line, "Skipping record: {}", reason);
                    return MapOutcome::Skipped(reason);
                }
            }
        }

        if attributes.is_empty() {
            warn!(source, line = record.line, "Skipping record: {}", SkipReason::NoAttributes);
            return MapOutcome::Skipped(SkipReason::NoAttributes);
        }
        MapOutcome::Mapped(MappedRecord { attributes, degraded })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::engine::schema::SchemaDiscoverer;
    use crate::engine::types::{CoercedValue, Namespace, ValueKind};
    use crate::sources::SourceField;
    use crate::store::InMemoryStore;

    fn schema(names: &[&str]) -> Schema {
        let fields: Vec<_> = names.iter().map(|n| SourceField::new(*n)).collect();
        SchemaDiscoverer::new(&IngestConfig::default())
            .unwrap()
            .discover("events.csv", &fields)
            .unwrap()
    }

    fn record(values: &[&str]) -> RawRecord {
        RawRecord::new(2, values.iter().map(|v| RawValue::from(*v)).collect())
    }

    #[test]
    fn test_maps_typed_values() {
        let store = InMemoryStore::new();
        let mut registry = RunRegistry::new(&store, Namespace::new("CS").unwrap());
        let schema = schema(&["ID", "SYSTEM_TIME", "NOTE"]);
        let mapper = RecordMapper::new(&schema, "chainsaw");

        let MapOutcome::Mapped(mapped) = mapper.map(&mut registry, &record(&["7", "2021-01-01 00:00:00", "hello"])) else {
            panic!("record should map");
        };
        let values: Vec<_> = mapped.attributes.iter().map(|a| a.value.clone()).collect();
        assert_eq!(
            values,
            vec![
                CoercedValue::Int64(7),
                CoercedValue::EpochSeconds(1_609_459_200),
                CoercedValue::String("hello".into())
            ]
        );
        assert_eq!(mapped.attributes[0].attribute_type.kind(), ValueKind::Integer);
        assert_eq!(mapped.degraded, 0);
    }

    #[test]
    fn test_length_mismatch_creates_nothing() {
        let store = InMemoryStore::new();
        let mut registry = RunRegistry::new(&store, Namespace::new("CS").unwrap());
        let schema = schema(&["ID", "SYSTEM_TIME", "NOTE"]);
        let mapper = RecordMapper::new(&schema, "chainsaw");

        let outcome = mapper.map(&mut registry, &record(&["7", "hello"]));
        assert_eq!(
            outcome,
            MapOutcome::Skipped(SkipReason::FieldCountMismatch { expected: 3, actual: 2 })
        );
        assert!(store.attribute_types().unwrap().is_empty());
    }

    #[test]
    fn test_bad_datetime_keeps_record() {
        let store = InMemoryStore::new();
        let mut registry = RunRegistry::new(&store, Namespace::new("CS").unwrap());
        let schema = schema(&["ID", "SYSTEM_TIME", "NOTE"]);
        let mapper = RecordMapper::new(&schema, "chainsaw");

        let MapOutcome::Mapped(mapped) = mapper.map(&mut registry, &record(&["7", "yesterday", "hello"])) else {
            panic!("record should map");
        };
        assert_eq!(mapped.attributes[1].value, CoercedValue::EpochSeconds(0));
        assert_eq!(mapped.attributes[2].value, CoercedValue::String("hello".into()));
        assert_eq!(mapped.degraded, 1);
    }

    #[test]
    fn test_bad_integer_drops_record() {
        let store = InMemoryStore::new();
        let mut registry = RunRegistry::new(&store, Namespace::new("CS").unwrap());
        let schema = schema(&["ID", "NOTE"]);
        let mapper = RecordMapper::new(&schema, "chainsaw");

        let outcome = mapper.map(&mut registry, &record(&["seven", "hello"]));
        assert!(matches!(outcome, MapOutcome::Skipped(SkipReason::Coercion { ref field, .. }) if field.as_str() == "ID"));
    }

    #[test]
    fn test_blank_record() {
        let store = InMemoryStore::new();
        let mut registry = RunRegistry::new(&store, Namespace::new("CS").unwrap());
        let schema = schema(&["ID", "NOTE"]);
        let mapper = RecordMapper::new(&schema, "chainsaw");
        assert_eq!(mapper.map(&mut registry, &record(&[""])), MapOutcome::Skipped(SkipReason::Blank));
    }

    #[test]
    fn test_dropped_field_is_omitted() {
        let store = InMemoryStore::new();
        let mut registry = RunRegistry::new(&store, Namespace::new("CS").unwrap());
        let schema = schema(&["ID", "NOTE"]);
        store.set_available(false);
        registry.resolve(&FieldName::new("NOTE"), ValueKind::String, "NOTE");
        store.set_available(true);

        let mapper = RecordMapper::new(&schema, "chainsaw");
        let MapOutcome::Mapped(mapped) = mapper.map(&mut registry, &record(&["1", "hello"])) else {
            panic!("record should map");
        };
        assert_eq!(mapped.attributes.len(), 1);
        assert_eq!(mapped.attributes[0].attribute_type.type_name(), "CS_ID");
    }
}
