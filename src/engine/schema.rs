//! Schema discovery
//!
//! Turns a record source's field list into an ordered schema: normalized
//! names, value kinds and (for DATETIME fields) the compiled epoch rule.
//!
//! Kind resolution order for each field:
//! 1. explicit `field_kinds` override
//! 2. first matching `type_rules` regex (defaults: `SYSTEM_TIME` → DATETIME, `^ID$` → INTEGER)
//! 3. native hint from the source (SQLite declared type, plist value type)
//! 4. STRING

use std::collections::{HashMap, HashSet};

use regex::Regex;
use tracing::{debug, warn};

use super::coercion::EpochConverter;
use super::types::{FieldName, ValueKind};
use crate::config::IngestConfig;
use crate::error::{ConfigError, SchemaError};
use crate::sources::SourceField;

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaField {
    /// Position in each raw record
    pub index: usize,
    pub name: FieldName,
    /// Name as the source spelled it
    pub raw_name: String,
    pub kind: ValueKind,
    /// Human-readable attribute label
    pub label: String,
    /// Set for DATETIME fields only
    pub epoch: Option<EpochConverter>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    source_name: String,
    fields: Vec<SchemaField>,
}

impl Schema {
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        let name = FieldName::new(name);
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Resolves field kinds and epoch rules from an [`IngestConfig`]
pub struct SchemaDiscoverer {
    overrides: HashMap<FieldName, ValueKind>,
    rules: Vec<(Regex, ValueKind)>,
    default_epoch: EpochConverter,
    field_epochs: HashMap<FieldName, EpochConverter>,
}

impl SchemaDiscoverer {
    pub fn new(config: &IngestConfig) -> Result<Self, ConfigError> {
        let overrides = config
            .field_kinds
            .iter()
            .map(|(name, kind)| (FieldName::new(name), *kind))
            .collect();
        let field_epochs = config
            .datetime
            .fields
            .iter()
            .map(|(name, rule)| Ok((FieldName::new(name), EpochConverter::from_rule(rule)?)))
            .collect::<Result<HashMap<_, _>, ConfigError>>()?;

        Ok(Self {
            overrides,
            rules: config.compile_type_rules()?,
            default_epoch: EpochConverter::from_rule(&config.datetime.default)?,
            field_epochs,
        })
    }

    /// Kind for a normalized field name, given the source's native hint
    pub fn resolve_kind(&self, name: &FieldName, hint: Option<ValueKind>) -> ValueKind {
        if let Some(kind) = self.overrides.get(name) {
            return *kind;
        }
        if let Some((_, kind)) = self.rules.iter().find(|(re, _)| re.is_match(name.as_str())) {
            return *kind;
        }
        hint.unwrap_or(ValueKind::String)
    }

    pub fn discover(&self, source_name: &str, source_fields: &[SourceField]) -> Result<Schema, SchemaError> {
        if source_fields.is_empty() {
            return Err(SchemaError::Empty {
                source_name: source_name.to_string(),
            });
        }

        let mut seen = HashSet::new();
        let mut fields = Vec::with_capacity(source_fields.len());
        for (index, source_field) in source_fields.iter().enumerate() {
            let raw_name = source_field.name.trim().to_string();
            let name = if raw_name.is_empty() {
                let synthetic = FieldName::new(&format!("FIELD_{}", index + 1));
                warn!(source = source_name, index, name = %synthetic, "Blank field name, using positional name");
                synthetic
            } else {
                FieldName::new(&raw_name)
            };
            if !seen.insert(name.clone()) {
                warn!(source = source_name, field = %name, "Duplicate field name; values share one attribute type");
            }

            let kind = self.resolve_kind(&name, source_field.hint);
            let epoch = (kind == ValueKind::DateTime).then(|| {
                self.field_epochs
                    .get(&name)
                    .cloned()
                    .unwrap_or_else(|| self.default_epoch.clone())
            });
            let label = if raw_name.is_empty() {
                name.as_str().replace('_', " ")
            } else {
                raw_name.replace('_', " ")
            };

            debug!(source = source_name, field = %name, kind = %kind, "Discovered field");
            fields.push(SchemaField {
                index,
                name,
                raw_name,
                kind,
                label,
                epoch,
            });
        }

        Ok(Schema {
            source_name: source_name.to_string(),
            fields,
        })
    }
}
