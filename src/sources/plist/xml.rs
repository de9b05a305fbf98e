//! XML property list reader

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::reader::Reader;

use super::value::{PlistDict, PlistValue};
use crate::error::SourceError;

enum Frame {
    Array(Vec<PlistValue>),
    Dict(PlistDict, Option<String>),
}

fn plist_err(message: impl Into<String>) -> SourceError {
    SourceError::Plist(message.into())
}

/// Parse an XML property list document
pub fn parse_xml(data: &[u8]) -> Result<PlistValue, SourceError> {
    let mut reader = Reader::from_reader(data);
    let mut buf = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    // Some while inside a scalar element
    let mut text: Option<String> = None;
    let mut root: Option<PlistValue> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"plist" => {}
                b"array" => stack.push(Frame::Array(Vec::new())),
                b"dict" => stack.push(Frame::Dict(Vec::new(), None)),
                b"key" | b"string" | b"integer" | b"real" | b"date" | b"data" | b"true" | b"false" => {
                    text = Some(String::new())
                }
                other => {
                    return Err(plist_err(format!(
                        "unexpected element <{}>",
                        String::from_utf8_lossy(other)
                    )))
                }
            },
            Ok(Event::Empty(ref e)) => {
                let name = e.name();
                if name.as_ref() == b"key" {
                    set_key(&mut stack, String::new())?;
                } else if name.as_ref() != b"plist" {
                    let value = match name.as_ref() {
                        b"true" => PlistValue::Bool(true),
                        b"false" => PlistValue::Bool(false),
                        b"string" => PlistValue::String(String::new()),
                        b"data" => PlistValue::Data(Vec::new()),
                        b"array" => PlistValue::Array(Vec::new()),
                        b"dict" => PlistValue::Dict(Vec::new()),
                        other => {
                            return Err(plist_err(format!(
                                "unexpected empty element <{}/>",
                                String::from_utf8_lossy(other)
                            )))
                        }
                    };
                    emit(&mut stack, &mut root, value)?;
                }
            }
            Ok(Event::Text(ref e)) => {
                if let Some(t) = text.as_mut() {
                    let unescaped = e.unescape().map_err(|err| plist_err(err.to_string()))?;
                    t.push_str(&unescaped);
                }
            }
            Ok(Event::CData(ref e)) => {
                if let Some(t) = text.as_mut() {
                    t.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::End(ref e)) => {
                let name = e.name();
                match name.as_ref() {
                    b"plist" => {}
                    b"array" | b"dict" => {
                        let value = match stack.pop() {
                            Some(Frame::Array(items)) => PlistValue::Array(items),
                            Some(Frame::Dict(entries, None)) => PlistValue::Dict(entries),
                            Some(Frame::Dict(_, Some(key))) => {
                                return Err(plist_err(format!("key '{}' has no value", key)))
                            }
                            None => return Err(plist_err("unbalanced container end")),
                        };
                        emit(&mut stack, &mut root, value)?;
                    }
                    b"key" => {
                        let key = text.take().unwrap_or_default();
                        set_key(&mut stack, key)?;
                    }
                    tag => {
                        let content = text.take().unwrap_or_default();
                        let value = scalar(tag, &content)?;
                        emit(&mut stack, &mut root, value)?;
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(plist_err(format!(
                    "XML error at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(plist_err("document ended inside a container"));
    }
    root.ok_or_else(|| plist_err("document has no root value"))
}

fn set_key(stack: &mut [Frame], key: String) -> Result<(), SourceError> {
    match stack.last_mut() {
        Some(Frame::Dict(_, pending)) => {
            *pending = Some(key);
            Ok(())
        }
        _ => Err(plist_err(format!("<key>{}</key> outside a dict", key))),
    }
}

fn emit(stack: &mut [Frame], root: &mut Option<PlistValue>, value: PlistValue) -> Result<(), SourceError> {
    match stack.last_mut() {
        None => {
            if root.is_some() {
                return Err(plist_err("more than one root value"));
            }
            *root = Some(value);
        }
        Some(Frame::Array(items)) => items.push(value),
        Some(Frame::Dict(entries, pending)) => {
            let key = pending.take().ok_or_else(|| plist_err("dict value without a key"))?;
            entries.push((key, value));
        }
    }
    Ok(())
}

fn scalar(tag: &[u8], content: &str) -> Result<PlistValue, SourceError> {
    let bad = |what: &str| plist_err(format!("invalid {} '{}'", what, content.trim()));
    Ok(match tag {
        b"string" => PlistValue::String(content.to_string()),
        b"integer" => {
            let t = content.trim();
            match t.parse::<i64>() {
                Ok(n) => PlistValue::Integer(n),
                // Unsigned 64-bit values keep their bit pattern
                Err(_) => PlistValue::Integer(t.parse::<u64>().map_err(|_| bad("integer"))? as i64),
            }
        }
        b"real" => PlistValue::Real(content.trim().parse::<f64>().map_err(|_| bad("real"))?),
        b"date" => PlistValue::Date(
            DateTime::parse_from_rfc3339(content.trim())
                .map_err(|_| bad("date"))?
                .with_timezone(&Utc),
        ),
        b"data" => {
            let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
            PlistValue::Data(STANDARD.decode(compact).map_err(|_| bad("data"))?)
        }
        b"true" => PlistValue::Bool(true),
        b"false" => PlistValue::Bool(false),
        other => {
            return Err(plist_err(format!(
                "unexpected element </{}>",
                String::from_utf8_lossy(other)
            )))
        }
    })
}
