//! Property list value model

use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};

use crate::engine::coercion::hex_with_separator;
use crate::engine::types::{RawValue, ValueKind};

/// Dictionary entries in document order
pub type PlistDict = Vec<(String, PlistValue)>;

#[derive(Debug, Clone, PartialEq)]
pub enum PlistValue {
    String(String),
    Integer(i64),
    Real(f64),
    Bool(bool),
    Date(DateTime<Utc>),
    Data(Vec<u8>),
    Array(Vec<PlistValue>),
    Dict(PlistDict),
}

impl PlistValue {
    pub fn as_dict(&self) -> Option<&PlistDict> {
        match self {
            PlistValue::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Direct child of a dictionary
    pub fn get(&self, key: &str) -> Option<&PlistValue> {
        self.as_dict()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Dotted key path lookup (`tile-data.file-label`)
    ///
    /// Keys may themselves contain dots, so an exact key match is tried before
    /// each possible split.
    pub fn get_path(&self, path: &str) -> Option<&PlistValue> {
        if let Some(value) = self.get(path) {
            return Some(value);
        }
        path.match_indices('.').find_map(|(i, _)| {
            self.get(&path[..i])
                .and_then(|child| child.get_path(&path[i + 1..]))
        })
    }

    /// Native type hint for schema discovery
    pub fn hint(&self) -> Option<ValueKind> {
        match self {
            PlistValue::Integer(_) => Some(ValueKind::Long),
            PlistValue::Real(_) => Some(ValueKind::Double),
            PlistValue::Date(_) => Some(ValueKind::DateTime),
            _ => None,
        }
    }

    pub fn to_raw(&self) -> RawValue {
        match self {
            PlistValue::String(s) => RawValue::Text(s.clone()),
            PlistValue::Integer(n) => RawValue::Integer(*n),
            PlistValue::Real(f) => RawValue::Real(*f),
            PlistValue::Bool(b) => RawValue::Bool(*b),
            PlistValue::Date(d) => RawValue::Date(*d),
            PlistValue::Data(bytes) => RawValue::Bytes(bytes.clone()),
            PlistValue::Array(_) | PlistValue::Dict(_) => RawValue::Text(self.to_json().to_string()),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            PlistValue::String(s) => json!(s),
            PlistValue::Integer(n) => json!(n),
            PlistValue::Real(f) => json!(f),
            PlistValue::Bool(b) => json!(b),
            PlistValue::Date(d) => json!(d.to_rfc3339()),
            PlistValue::Data(bytes) => json!(hex_with_separator(bytes, ":")),
            PlistValue::Array(items) => JsonValue::Array(items.iter().map(|v| v.to_json()).collect()),
            PlistValue::Dict(entries) => JsonValue::Object(
                entries.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Leaf key paths of a dictionary; nested non-empty dictionaries are flattened
    pub fn flatten_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        flatten_into(self, "", &mut keys);
        keys
    }
}

fn flatten_into(value: &PlistValue, prefix: &str, keys: &mut Vec<String>) {
    let Some(entries) = value.as_dict() else {
        return;
    };
    for (key, child) in entries {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match child {
            PlistValue::Dict(inner) if !inner.is_empty() => flatten_into(child, &path, keys),
            _ => keys.push(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PlistValue {
        PlistValue::Dict(vec![
            ("name".into(), PlistValue::String("doc".into())),
            (
                "tile-data".into(),
                PlistValue::Dict(vec![("file-label".into(), PlistValue::String("Notes".into()))]),
            ),
            ("wifi.ssid".into(), PlistValue::Integer(3)),
            ("tags".into(), PlistValue::Array(vec![PlistValue::Bool(true)])),
        ])
    }

    #[test]
    fn test_get_path() {
        let doc = sample();
        assert_eq!(doc.get_path("tile-data.file-label"), Some(&PlistValue::String("Notes".into())));
        assert_eq!(doc.get_path("wifi.ssid"), Some(&PlistValue::Integer(3)));
        assert!(doc.get_path("tile-data.missing").is_none());
    }

    #[test]
    fn test_flatten_keys() {
        assert_eq!(sample().flatten_keys(), vec!["name", "tile-data.file-label", "wifi.ssid", "tags"]);
    }

    #[test]
    fn test_to_raw() {
        assert_eq!(PlistValue::Data(vec![0xde, 0xad]).to_raw(), RawValue::Bytes(vec![0xde, 0xad]));
        assert_eq!(
            PlistValue::Array(vec![PlistValue::Integer(1), PlistValue::String("a".into())]).to_raw(),
            RawValue::Text("[1,\"a\"]".into())
        );
        assert_eq!(PlistValue::Integer(5).hint(), Some(ValueKind::Long));
    }
}
