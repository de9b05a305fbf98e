//! Value coercion
//!
//! Converts raw source values into typed attribute values. Time-valued fields
//! go through one of four epoch conventions:
//!
//! | Rule       | Input                                  | Conversion                     |
//! |------------|----------------------------------------|--------------------------------|
//! | `calendar` | text in a caller-supplied date pattern | parsed, zone-adjusted to UTC   |
//! | `cocoa`    | seconds since 2001-01-01T00:00:00Z     | `+ 978307200`                  |
//! | `hfs`      | seconds since 1904-01-01T00:00:00Z     | masked to 32 bits, `- 2082844800` |
//! | `unix`     | seconds since 1970-01-01T00:00:00Z     | passthrough                    |
//!
//! Native dates (property-list `<date>`) are absolute and bypass the rule.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use super::types::{CoercedValue, FieldName, RawValue, ValueKind};
use crate::error::{CoercionError, ConfigError};

/// Seconds between the Unix epoch and the Cocoa reference date
pub const COCOA_EPOCH_OFFSET: i64 = 978_307_200;

/// Seconds between the HFS epoch (1904) and the Unix epoch
pub const HFS_EPOCH_OFFSET: i64 = 2_082_844_800;

const HFS_MASK: i64 = 0xFFFF_FFFF;

// =============================================================================
// Epoch Rules
// =============================================================================

/// Epoch convention for a DATETIME field, as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpochRule {
    /// Calendar string in a Java-style pattern such as `yyyy-MM-dd HH:mm:ss`
    Calendar(String),
    Cocoa,
    Hfs,
    Unix,
}

impl Default for EpochRule {
    fn default() -> Self {
        EpochRule::Calendar("yyyy-MM-dd HH:mm:ss".to_string())
    }
}

/// Compiled form of an [`EpochRule`]
#[derive(Debug, Clone, PartialEq)]
pub enum EpochConverter {
    Calendar(DatePattern),
    Cocoa,
    Hfs,
    Unix,
}

impl EpochConverter {
    pub fn from_rule(rule: &EpochRule) -> Result<Self, ConfigError> {
        Ok(match rule {
            EpochRule::Calendar(pattern) => EpochConverter::Calendar(DatePattern::compile(pattern)?),
            EpochRule::Cocoa => EpochConverter::Cocoa,
            EpochRule::Hfs => EpochConverter::Hfs,
            EpochRule::Unix => EpochConverter::Unix,
        })
    }

    /// Convert a raw value to Unix seconds
    pub fn to_epoch(&self, raw: &RawValue) -> Result<i64, CoercionError> {
        if let RawValue::Date(dt) = raw {
            return Ok(dt.timestamp());
        }
        match self {
            EpochConverter::Calendar(pattern) => match raw {
                RawValue::Text(text) => pattern.parse_epoch(text).ok_or_else(|| datetime_format(raw)),
                // Numeric values under a calendar rule are already Unix seconds
                _ => numeric_seconds(raw),
            },
            EpochConverter::Cocoa => numeric_seconds(raw)?
                .checked_add(COCOA_EPOCH_OFFSET)
                .ok_or_else(|| datetime_format(raw)),
            EpochConverter::Hfs => hfs_to_unix(numeric_seconds(raw)?).ok_or_else(|| datetime_format(raw)),
            EpochConverter::Unix => numeric_seconds(raw),
        }
    }
}

/// HFS seconds to Unix seconds
///
/// Values beyond the 32-bit unsigned range are masked to their low 32 bits first.
pub fn hfs_to_unix(mut seconds: i64) -> Option<i64> {
    if seconds > HFS_MASK {
        seconds &= HFS_MASK;
    }
    seconds.checked_abs().map(|s| s - HFS_EPOCH_OFFSET)
}

fn datetime_format(raw: &RawValue) -> CoercionError {
    CoercionError::Format {
        kind: ValueKind::DateTime,
        value: raw.preview(),
    }
}

fn numeric_seconds(raw: &RawValue) -> Result<i64, CoercionError> {
    match raw {
        RawValue::Integer(n) => Ok(*n),
        RawValue::Real(f) => round_seconds(*f).ok_or_else(|| datetime_format(raw)),
        RawValue::Text(text) => {
            let text = text.trim();
            if let Ok(n) = text.parse::<i64>() {
                return Ok(n);
            }
            text.parse::<f64>()
                .ok()
                .and_then(round_seconds)
                .ok_or_else(|| datetime_format(raw))
        }
        RawValue::Null => Err(CoercionError::Null {
            kind: ValueKind::DateTime,
        }),
        _ => Err(datetime_format(raw)),
    }
}

fn round_seconds(f: f64) -> Option<i64> {
    if f.is_finite() && f.abs() < i64::MAX as f64 {
        Some(f.round() as i64)
    } else {
        None
    }
}

// =============================================================================
// Date Patterns
// =============================================================================

/// Java/LDML style date pattern translated to a chrono format string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatePattern {
    source: String,
    format: String,
    /// Pattern carries a zone abbreviation (`z`), resolved through [`zone_offset`]
    zone_name: bool,
    /// Pattern carries a numeric offset (`Z`, `X`)
    zone_offset: bool,
    has_time: bool,
}

impl DatePattern {
    pub fn compile(pattern: &str) -> Result<Self, ConfigError> {
        if pattern.starts_with('%') {
            return Ok(Self {
                source: pattern.to_string(),
                format: pattern.to_string(),
                zone_name: pattern.contains("%Z"),
                zone_offset: pattern.contains("%z") || pattern.contains("%:z"),
                has_time: ["%H", "%I", "%T", "%R", "%s"].iter().any(|t| pattern.contains(t)),
            });
        }

        let invalid = |reason: String| ConfigError::DatePattern {
            pattern: pattern.to_string(),
            reason,
        };

        let chars: Vec<char> = pattern.chars().collect();
        let mut format = String::new();
        let mut zone_name = false;
        let mut zone_offset = false;
        let mut has_time = false;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            if c == '\'' {
                // Quoted literal; '' is an escaped quote
                if chars.get(i + 1) == Some(&'\'') {
                    format.push('\'');
                    i += 2;
                    continue;
                }
                let mut j = i + 1;
                while j < chars.len() && chars[j] != '\'' {
                    push_literal(&mut format, chars[j]);
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(invalid("unterminated quote".to_string()));
                }
                i = j + 1;
                continue;
            }
            if !c.is_ascii_alphabetic() {
                push_literal(&mut format, c);
                i += 1;
                continue;
            }

            let mut run = 1;
            while i + run < chars.len() && chars[i + run] == c {
                run += 1;
            }
            let spec = match (c, run) {
                ('y', 2) => "%y",
                ('y', _) => "%Y",
                ('M', 1 | 2) => "%m",
                ('M', 3) => "%b",
                ('M', _) => "%B",
                ('d', 1 | 2) => "%d",
                ('E', 1..=3) => "%a",
                ('E', _) => "%A",
                ('H', 1 | 2) => "%H",
                ('h', 1 | 2) => "%I",
                ('m', 1 | 2) => "%M",
                ('s', 1 | 2) => "%S",
                ('S', 3) => "%3f",
                ('S', 6) => "%6f",
                ('S', 9) => "%9f",
                ('a', 1) => "%p",
                ('z', _) => "%Z",
                ('Z', _) => "%z",
                ('X', 3) => "%:z",
                ('X', _) => "%z",
                _ => return Err(invalid(format!("unsupported field '{}'", c.to_string().repeat(run)))),
            };
            match c {
                'z' => zone_name = true,
                'Z' | 'X' => zone_offset = true,
                'H' | 'h' => has_time = true,
                _ => {}
            }
            format.push_str(spec);
            i += run;
        }

        Ok(Self {
            source: pattern.to_string(),
            format,
            zone_name,
            zone_offset,
            has_time,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn chrono_format(&self) -> &str {
        &self.format
    }

    /// Parse text to Unix seconds; `None` when the text does not match
    pub fn parse_epoch(&self, text: &str) -> Option<i64> {
        let text = text.trim();
        if self.zone_offset {
            return chrono::DateTime::parse_from_str(text, &self.format)
                .ok()
                .map(|dt| dt.timestamp());
        }

        let (text, format, offset) = if self.zone_name {
            strip_zone_token(text, &self.format)?
        } else {
            (text.to_string(), self.format.clone(), 0)
        };

        let naive = if self.has_time {
            NaiveDateTime::parse_from_str(&text, &format).ok()?
        } else {
            NaiveDate::parse_from_str(&text, &format).ok()?.and_hms_opt(0, 0, 0)?
        };
        trace!(pattern = %self.source, offset, "Parsed calendar timestamp");
        Some(naive.and_utc().timestamp() - offset)
    }
}

fn push_literal(format: &mut String, c: char) {
    if c == '%' {
        format.push_str("%%");
    } else {
        format.push(c);
    }
}

/// Remove the `%Z` token from the format and the matching word from the text,
/// returning the zone's UTC offset in seconds.
fn strip_zone_token(text: &str, format: &str) -> Option<(String, String, i64)> {
    let fmt_tokens: Vec<&str> = format.split_whitespace().collect();
    let text_tokens: Vec<&str> = text.split_whitespace().collect();
    if fmt_tokens.len() != text_tokens.len() {
        return None;
    }
    let idx = fmt_tokens.iter().position(|t| *t == "%Z")?;
    let offset = zone_offset(text_tokens[idx]).unwrap_or(0);

    let keep = |tokens: &[&str]| {
        tokens
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .map(|(_, t)| *t)
            .collect::<Vec<_>>()
            .join(" ")
    };
    Some((keep(&text_tokens), keep(&fmt_tokens), offset))
}

/// UTC offset in seconds for common zone abbreviations
pub fn zone_offset(abbrev: &str) -> Option<i64> {
    let hours = match abbrev.to_ascii_uppercase().as_str() {
        "UTC" | "GMT" | "Z" | "UT" => 0,
        "EST" => -5,
        "EDT" => -4,
        "CST" => -6,
        "CDT" => -5,
        "MST" => -7,
        "MDT" => -6,
        "PST" => -8,
        "PDT" => -7,
        _ => return None,
    };
    Some(hours * 3600)
}

// =============================================================================
// Coercion
// =============================================================================

/// Strictly coerce a raw value to `kind`
///
/// DATETIME fields use `epoch`, falling back to Unix seconds when none is given.
pub fn coerce(kind: ValueKind, raw: &RawValue, epoch: Option<&EpochConverter>) -> Result<CoercedValue, CoercionError> {
    if raw.is_null() {
        return Err(CoercionError::Null { kind });
    }
    let format_err = || CoercionError::Format {
        kind,
        value: raw.preview(),
    };

    match kind {
        ValueKind::String => Ok(CoercedValue::String(raw_to_string(raw))),
        ValueKind::Integer | ValueKind::Long => {
            let n = match raw {
                RawValue::Integer(n) => *n,
                RawValue::Text(text) => text.trim().parse::<i64>().map_err(|_| format_err())?,
                RawValue::Real(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => *f as i64,
                RawValue::Bool(b) => i64::from(*b),
                _ => return Err(format_err()),
            };
            if kind == ValueKind::Integer && i32::try_from(n).is_err() {
                return Err(format_err());
            }
            Ok(CoercedValue::Int64(n))
        }
        ValueKind::Double => {
            let f = match raw {
                RawValue::Real(f) => *f,
                RawValue::Integer(n) => *n as f64,
                RawValue::Text(text) => text.trim().parse::<f64>().map_err(|_| format_err())?,
                _ => return Err(format_err()),
            };
            Ok(CoercedValue::Float64(f))
        }
        ValueKind::DateTime => {
            let seconds = match epoch {
                Some(converter) => converter.to_epoch(raw)?,
                None => EpochConverter::Unix.to_epoch(raw)?,
            };
            Ok(CoercedValue::EpochSeconds(seconds))
        }
    }
}

/// Result of a lenient coercion
#[derive(Debug, Clone, PartialEq)]
pub struct Coercion {
    pub value: CoercedValue,
    /// DATETIME text could not be parsed and was replaced with 0
    pub degraded: bool,
}

/// Coerce a field value, degrading unparseable DATETIME values to 0
///
/// Null values and every non-DATETIME failure are returned as errors.
pub fn coerce_field(
    field: &FieldName,
    kind: ValueKind,
    raw: &RawValue,
    epoch: Option<&EpochConverter>,
) -> Result<Coercion, CoercionError> {
    match coerce(kind, raw, epoch) {
        Ok(value) => Ok(Coercion { value, degraded: false }),
        Err(CoercionError::Format { .. }) if kind == ValueKind::DateTime => {
            // The error carries a shortened preview; log the value as read
            warn!(field = %field, value = %raw_to_string(raw), "Unparseable timestamp, substituting 0");
            Ok(Coercion {
                value: CoercedValue::EpochSeconds(0),
                degraded: true,
            })
        }
        Err(e) => Err(e),
    }
}

/// Render any raw value as attribute text
pub fn raw_to_string(raw: &RawValue) -> String {
    match raw {
        RawValue::Null => String::new(),
        RawValue::Text(s) => s.clone(),
        RawValue::Integer(n) => n.to_string(),
        RawValue::Real(f) => f.to_string(),
        RawValue::Bool(b) => b.to_string(),
        RawValue::Bytes(bytes) => hex_with_separator(bytes, ":"),
        RawValue::Date(dt) => dt.to_rfc3339(),
    }
}

/// Upper-case hex with a separator between bytes (`00:1A:2B`)
pub fn hex_with_separator(bytes: &[u8], separator: &str) -> String {
    bytes
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(separator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn calendar(pattern: &str) -> EpochConverter {
        EpochConverter::from_rule(&EpochRule::Calendar(pattern.to_string())).unwrap()
    }

    #[test]
    fn test_cocoa_zero() {
        assert_eq!(EpochConverter::Cocoa.to_epoch(&RawValue::Integer(0)).unwrap(), 978_307_200);
        assert_eq!(EpochConverter::Cocoa.to_epoch(&RawValue::Real(0.4)).unwrap(), 978_307_200);
    }

    #[test]
    fn test_hfs_epoch() {
        assert_eq!(EpochConverter::Hfs.to_epoch(&RawValue::Integer(2_082_844_800)).unwrap(), 0);
        // High bits are masked away before conversion
        let masked = (1_i64 << 32) | 2_082_844_800;
        assert_eq!(hfs_to_unix(masked), Some(0));
    }

    #[test]
    fn test_unix_passthrough() {
        let v = coerce(ValueKind::DateTime, &RawValue::from("1609459200"), Some(&EpochConverter::Unix)).unwrap();
        assert_eq!(v, CoercedValue::EpochSeconds(1_609_459_200));
    }

    #[test]
    fn test_calendar_default_pattern() {
        let conv = calendar("yyyy-MM-dd HH:mm:ss");
        assert_eq!(conv.to_epoch(&RawValue::from("2021-01-01 00:00:00")).unwrap(), 1_609_459_200);
    }

    #[test]
    fn test_calendar_with_zone_abbreviation() {
        let conv = calendar("EEE MMM d HH:mm:ss z yyyy");
        let utc = conv.to_epoch(&RawValue::from("Tue Jan 5 10:00:00 UTC 2021")).unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2021, 1, 5, 10, 0, 0).unwrap().timestamp());
        let pst = conv.to_epoch(&RawValue::from("Tue Jan 5 10:00:00 PST 2021")).unwrap();
        assert_eq!(pst - utc, 8 * 3600);
    }

    #[test]
    fn test_calendar_numeric_offset() {
        let conv = calendar("yyyy-MM-dd'T'HH:mm:ssXXX");
        let ts = conv.to_epoch(&RawValue::from("2021-01-01T02:00:00+02:00")).unwrap();
        assert_eq!(ts, 1_609_459_200);
    }

    #[test]
    fn test_calendar_date_only() {
        let conv = calendar("dd/MM/yyyy");
        assert_eq!(conv.to_epoch(&RawValue::from("01/01/2021")).unwrap(), 1_609_459_200);
    }

    #[test]
    fn test_pattern_translation() {
        let p = DatePattern::compile("yyyy-MM-dd HH:mm:ss.SSS").unwrap();
        assert_eq!(p.chrono_format(), "%Y-%m-%d %H:%M:%S.%3f");
        assert!(DatePattern::compile("yyyy-QQ").is_err());
        assert!(DatePattern::compile("'unterminated").is_err());
        assert_eq!(DatePattern::compile("%s").unwrap().chrono_format(), "%s");
    }

    #[test]
    fn test_native_date_bypasses_rule() {
        let dt = Utc.with_ymd_and_hms(2020, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(EpochConverter::Cocoa.to_epoch(&RawValue::Date(dt)).unwrap(), dt.timestamp());
    }

    #[test]
    fn test_datetime_failure_degrades_to_zero() {
        let conv = calendar("yyyy-MM-dd HH:mm:ss");
        let field = FieldName::new("SYSTEM_TIME");
        let c = coerce_field(&field, ValueKind::DateTime, &RawValue::from("not a date"), Some(&conv)).unwrap();
        assert_eq!(c.value, CoercedValue::EpochSeconds(0));
        assert!(c.degraded);
    }

    #[test]
    fn test_cocoa_overflow_degrades_to_zero() {
        let field = FieldName::new("ZSTARTDATE");
        assert!(EpochConverter::Cocoa.to_epoch(&RawValue::Integer(i64::MAX)).is_err());
        let c = coerce_field(&field, ValueKind::DateTime, &RawValue::Integer(i64::MAX), Some(&EpochConverter::Cocoa)).unwrap();
        assert_eq!(c.value, CoercedValue::EpochSeconds(0));
        assert!(c.degraded);
    }

    #[test]
    fn test_degraded_datetime_logs_full_value() {
        use std::io::Write;
        use std::sync::{Arc, Mutex};

        #[derive(Clone)]
        struct Capture(Arc<Mutex<Vec<u8>>>);

        impl Write for Capture {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let captured = Capture(Arc::new(Mutex::new(Vec::new())));
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let long = format!("garbage-{}-end", "x".repeat(100));
        let conv = calendar("yyyy-MM-dd HH:mm:ss");
        let field = FieldName::new("SYSTEM_TIME");
        let c = tracing::subscriber::with_default(subscriber, || {
            coerce_field(&field, ValueKind::DateTime, &RawValue::from(long.as_str()), Some(&conv)).unwrap()
        });
        assert_eq!(c.value, CoercedValue::EpochSeconds(0));
        assert!(c.degraded);

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Unparseable timestamp"));
        assert!(output.contains(&long));
    }

    #[test]
    fn test_datetime_null_is_error() {
        let field = FieldName::new("SYSTEM_TIME");
        let err = coerce_field(&field, ValueKind::DateTime, &RawValue::Null, None).unwrap_err();
        assert_eq!(err, CoercionError::Null { kind: ValueKind::DateTime });
    }

    #[test]
    fn test_integer_coercion() {
        assert_eq!(coerce(ValueKind::Integer, &RawValue::from(" 7 "), None).unwrap(), CoercedValue::Int64(7));
        assert!(matches!(
            coerce(ValueKind::Integer, &RawValue::from("seven"), None),
            Err(CoercionError::Format { .. })
        ));
        assert!(coerce(ValueKind::Integer, &RawValue::Integer(1 << 40), None).is_err());
        assert_eq!(
            coerce(ValueKind::Long, &RawValue::Integer(1 << 40), None).unwrap(),
            CoercedValue::Int64(1 << 40)
        );
    }

    #[test]
    fn test_double_coercion() {
        assert_eq!(coerce(ValueKind::Double, &RawValue::from("2.5"), None).unwrap(), CoercedValue::Float64(2.5));
        assert!(coerce(ValueKind::Double, &RawValue::from("2.5.1"), None).is_err());
    }

    #[test]
    fn test_string_coercion() {
        assert_eq!(coerce(ValueKind::String, &RawValue::from("hello"), None).unwrap(), CoercedValue::String("hello".into()));
        assert_eq!(
            coerce(ValueKind::String, &RawValue::Null, None).unwrap_err(),
            CoercionError::Null { kind: ValueKind::String }
        );
        let mac = RawValue::Bytes(vec![0x00, 0x1a, 0x2b]);
        assert_eq!(coerce(ValueKind::String, &mac, None).unwrap(), CoercedValue::String("00:1A:2B".into()));
    }
}
