//! Ingestion configuration
//!
//! Stored as JSON. Every field has a default, so a config file only needs to
//! name what it changes:
//!
//! ```json
//! {
//!   "namespace": "CS",
//!   "datetime": { "default": { "calendar": "yyyy-MM-dd HH:mm:ss" } },
//!   "emission": { "TSK_OS_INFO": "merge_singleton" }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::coercion::{EpochConverter, EpochRule};
use crate::engine::types::{EmissionPolicy, FieldName, Namespace, ValueKind};
use crate::error::ConfigError;

/// Current config file format version
pub const CONFIG_VERSION: u32 = 1;

/// Records read between cancellation polls within one source
pub const DEFAULT_CANCEL_CHECK_INTERVAL: usize = 256;

/// Maps field names matching `pattern` to `kind`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRule {
    /// Regex matched against the normalized (upper-case) field name
    pub pattern: String,
    pub kind: ValueKind,
}

impl TypeRule {
    pub fn new(pattern: &str, kind: ValueKind) -> Self {
        Self {
            pattern: pattern.to_string(),
            kind,
        }
    }
}

/// Epoch conventions for DATETIME fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DateTimePolicy {
    /// Rule for fields without an override
    pub default: EpochRule,
    /// Per-field overrides keyed by field name
    pub fields: BTreeMap<String, EpochRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub version: u32,
    /// Attribute type prefix
    pub namespace: Namespace,
    /// Recorded as the producer of every attribute and batch
    pub module_name: String,
    /// Ordered name rules; first match wins
    pub type_rules: Vec<TypeRule>,
    /// Explicit kinds keyed by field name, checked before the rules
    pub field_kinds: BTreeMap<String, ValueKind>,
    pub datetime: DateTimePolicy,
    /// Policy per artifact kind name; unlisted kinds create new artifacts
    pub emission: BTreeMap<String, EmissionPolicy>,
    pub cancel_check_interval: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            namespace: Namespace::known("CS"),
            module_name: "ffx-ingest".to_string(),
            type_rules: vec![
                TypeRule::new("SYSTEM_TIME", ValueKind::DateTime),
                TypeRule::new("^ID$", ValueKind::Integer),
            ],
            field_kinds: BTreeMap::new(),
            datetime: DateTimePolicy::default(),
            emission: BTreeMap::new(),
            cancel_check_interval: DEFAULT_CANCEL_CHECK_INTERVAL,
        }
    }
}

impl IngestConfig {
    /// Preset for macOS recent-activity property lists and databases
    pub fn macos() -> Self {
        let mut emission = BTreeMap::new();
        emission.insert("TSK_OS_INFO".to_string(), EmissionPolicy::MergeSingleton);
        Self {
            namespace: Namespace::known("RA"),
            module_name: "recent-activity".to_string(),
            datetime: DateTimePolicy {
                default: EpochRule::Cocoa,
                fields: BTreeMap::new(),
            },
            emission,
            ..Self::default()
        }
    }

    /// Load a config file, validating rules and date patterns
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading ingest config from: {}", path.display());
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: IngestConfig = serde_json::from_str(&json)?;
        if config.version > CONFIG_VERSION {
            warn!(
                "Config version {} is newer than supported version {}",
                config.version, CONFIG_VERSION
            );
        }
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, &json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Config saved: {} bytes", json.len());
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.compile_type_rules()?;
        EpochConverter::from_rule(&self.datetime.default)?;
        for rule in self.datetime.fields.values() {
            EpochConverter::from_rule(rule)?;
        }
        Ok(())
    }

    pub fn compile_type_rules(&self) -> Result<Vec<(Regex, ValueKind)>, ConfigError> {
        self.type_rules
            .iter()
            .map(|rule| {
                Regex::new(&rule.pattern)
                    .map(|re| (re, rule.kind))
                    .map_err(|source| ConfigError::Rule {
                        pattern: rule.pattern.clone(),
                        source,
                    })
            })
            .collect()
    }

    /// Explicit kind for a field, if configured
    pub fn kind_override(&self, field: &FieldName) -> Option<ValueKind> {
        self.field_kinds
            .iter()
            .find(|(name, _)| FieldName::new(name) == *field)
            .map(|(_, kind)| *kind)
    }

    pub fn epoch_rule_for(&self, field: &FieldName) -> &EpochRule {
        self.datetime
            .fields
            .iter()
            .find(|(name, _)| FieldName::new(name) == *field)
            .map(|(_, rule)| rule)
            .unwrap_or(&self.datetime.default)
    }

    pub fn policy_for(&self, artifact_kind: &str) -> EmissionPolicy {
        self.emission.get(artifact_kind).copied().unwrap_or_default()
    }

    pub fn cancel_interval(&self) -> usize {
        self.cancel_check_interval.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_rules_compile() {
        let config = IngestConfig::default();
        let rules = config.compile_type_rules().unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules[0].0.is_match("EVENT_SYSTEM_TIME"));
        assert!(rules[1].0.is_match("ID"));
        assert!(!rules[1].0.is_match("EVENT_ID"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: IngestConfig = serde_json::from_str(
            r#"{ "namespace": "ra", "emission": { "TSK_OS_INFO": "merge_singleton" } }"#,
        )
        .unwrap();
        assert_eq!(config.namespace.as_str(), "RA");
        assert_eq!(config.policy_for("TSK_OS_INFO"), EmissionPolicy::MergeSingleton);
        assert_eq!(config.policy_for("CS_EVENTS"), EmissionPolicy::CreateNew);
        assert_eq!(config.cancel_check_interval, DEFAULT_CANCEL_CHECK_INTERVAL);
    }

    #[test]
    fn test_epoch_rule_json() {
        let config: IngestConfig = serde_json::from_str(
            r#"{ "datetime": { "default": "cocoa", "fields": { "last_connected": "hfs" } } }"#,
        )
        .unwrap();
        assert_eq!(config.epoch_rule_for(&FieldName::new("LAST_CONNECTED")), &EpochRule::Hfs);
        assert_eq!(config.epoch_rule_for(&FieldName::new("OTHER")), &EpochRule::Cocoa);
    }

    #[test]
    fn test_invalid_namespace_rejected() {
        let result = serde_json::from_str::<IngestConfig>(r#"{ "namespace": "has space" }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ingest.json");
        let mut config = IngestConfig::macos();
        config.field_kinds.insert("count".to_string(), ValueKind::Long);
        config.save(&path).unwrap();

        let loaded = IngestConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.kind_override(&FieldName::new("COUNT")), Some(ValueKind::Long));
    }

    #[test]
    fn test_load_rejects_bad_rule() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{ "type_rules": [ { "pattern": "(", "kind": "STRING" } ] }"#).unwrap();
        assert!(matches!(IngestConfig::load(&path), Err(ConfigError::Rule { .. })));
    }
}
