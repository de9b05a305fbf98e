//! Binary property list reader (`bplist00`)
//!
//! Layout:
//! - 8-byte magic `bplist00`
//! - object table (marker byte + payload per object)
//! - offset table (one big-endian offset per object)
//! - 32-byte trailer: offset int size, object ref size, object count,
//!   top object index, offset table position

use std::cell::Cell;

use chrono::{DateTime, Utc};

use super::value::PlistValue;
use crate::common::binary::{read_bytes_at, read_u64_be_at, read_u8_at, read_uint_be_at};
use crate::engine::coercion::COCOA_EPOCH_OFFSET;
use crate::error::SourceError;

pub const BPLIST_MAGIC: &[u8] = b"bplist00";

const TRAILER_SIZE: usize = 32;
const MAX_DEPTH: usize = 128;
/// Decoded objects allowed per stored object before a document is rejected.
/// Shared references are decoded once per use, so nested sharing multiplies.
const OBJECT_BUDGET_FACTOR: usize = 64;
const MIN_OBJECT_BUDGET: usize = 1 << 20;

struct Trailer {
    offset_size: usize,
    ref_size: usize,
    num_objects: usize,
    top_object: usize,
    offset_table: usize,
}

struct BinaryPlist<'a> {
    data: &'a [u8],
    trailer: Trailer,
    budget: Cell<usize>,
}

fn plist_err(message: impl Into<String>) -> SourceError {
    SourceError::Plist(message.into())
}

pub fn is_binary_plist(data: &[u8]) -> bool {
    data.starts_with(BPLIST_MAGIC)
}

/// Parse a binary property list document
pub fn parse_binary(data: &[u8]) -> Result<PlistValue, SourceError> {
    if !is_binary_plist(data) {
        return Err(plist_err("missing bplist00 magic"));
    }
    if data.len() < BPLIST_MAGIC.len() + TRAILER_SIZE {
        return Err(plist_err("binary plist too short"));
    }

    let t = data.len() - TRAILER_SIZE;
    let to_usize = |v: u64| usize::try_from(v).map_err(|_| plist_err("trailer value out of range"));
    let trailer = Trailer {
        offset_size: read_u8_at(data, t + 6).map_err(plist_err)? as usize,
        ref_size: read_u8_at(data, t + 7).map_err(plist_err)? as usize,
        num_objects: to_usize(read_u64_be_at(data, t + 8).map_err(plist_err)?)?,
        top_object: to_usize(read_u64_be_at(data, t + 16).map_err(plist_err)?)?,
        offset_table: to_usize(read_u64_be_at(data, t + 24).map_err(plist_err)?)?,
    };
    if trailer.top_object >= trailer.num_objects {
        return Err(plist_err("top object index out of range"));
    }
    for (name, size) in [("offset", trailer.offset_size), ("object ref", trailer.ref_size)] {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(plist_err(format!("unsupported {} size {}", name, size)));
        }
    }
    let table_end = trailer
        .num_objects
        .checked_mul(trailer.offset_size)
        .and_then(|len| len.checked_add(trailer.offset_table));
    if !table_end.is_some_and(|end| end <= t) {
        return Err(plist_err("offset table runs past trailer"));
    }

    let budget = trailer
        .num_objects
        .saturating_mul(OBJECT_BUDGET_FACTOR)
        .max(MIN_OBJECT_BUDGET);
    let plist = BinaryPlist {
        data,
        trailer,
        budget: Cell::new(budget),
    };
    plist.object(plist.trailer.top_object, 0)
}

impl<'a> BinaryPlist<'a> {
    fn offset_of(&self, index: usize) -> Result<usize, SourceError> {
        if index >= self.trailer.num_objects {
            return Err(plist_err(format!("object ref {} out of range", index)));
        }
        let pos = index
            .checked_mul(self.trailer.offset_size)
            .and_then(|p| p.checked_add(self.trailer.offset_table))
            .ok_or_else(|| plist_err("offset table overflow"))?;
        let offset = read_uint_be_at(self.data, pos, self.trailer.offset_size).map_err(plist_err)?;
        usize::try_from(offset).map_err(|_| plist_err("object offset out of range"))
    }

    /// `count` object refs starting at `start`; the whole table must lie inside the document
    fn object_refs(&self, start: usize, count: usize) -> Result<Vec<usize>, SourceError> {
        let ref_size = self.trailer.ref_size;
        let table_len = count
            .checked_mul(ref_size)
            .ok_or_else(|| plist_err(format!("object ref count {} overflows", count)))?;
        let table = read_bytes_at(self.data, start, table_len).map_err(plist_err)?;
        table
            .chunks_exact(ref_size)
            .map(|chunk| {
                let r = read_uint_be_at(chunk, 0, ref_size).map_err(plist_err)?;
                usize::try_from(r).map_err(|_| plist_err("object ref out of range"))
            })
            .collect()
    }

    /// Length from the marker's low nibble, or a following int object when it is 0xF.
    /// Returns (length, payload start).
    fn length(&self, offset: usize, info: u8) -> Result<(usize, usize), SourceError> {
        if info != 0x0F {
            return Ok((info as usize, offset + 1));
        }
        let marker = read_u8_at(self.data, offset + 1).map_err(plist_err)?;
        if marker >> 4 != 0x1 {
            return Err(plist_err(format!("bad length marker 0x{:02x}", marker)));
        }
        let width = 1usize << (marker & 0x0F);
        let len = read_uint_be_at(self.data, offset + 2, width).map_err(plist_err)?;
        let len = usize::try_from(len).map_err(|_| plist_err("length out of range"))?;
        Ok((len, offset + 2 + width))
    }

    fn object(&self, index: usize, depth: usize) -> Result<PlistValue, SourceError> {
        if depth > MAX_DEPTH {
            return Err(plist_err("object nesting too deep"));
        }
        let remaining = self.budget.get();
        if remaining == 0 {
            return Err(plist_err("too many object references"));
        }
        self.budget.set(remaining - 1);
        let offset = self.offset_of(index)?;
        let marker = read_u8_at(self.data, offset).map_err(plist_err)?;
        let (kind, info) = (marker >> 4, marker & 0x0F);

        match kind {
            0x0 => match info {
                0x8 => Ok(PlistValue::Bool(false)),
                0x9 => Ok(PlistValue::Bool(true)),
                _ => Err(plist_err(format!("unsupported singleton 0x{:02x}", marker))),
            },
            0x1 => {
                let width = 1usize << info;
                match width {
                    1 | 2 | 4 => Ok(PlistValue::Integer(
                        read_uint_be_at(self.data, offset + 1, width).map_err(plist_err)? as i64,
                    )),
                    8 => Ok(PlistValue::Integer(
                        read_u64_be_at(self.data, offset + 1).map_err(plist_err)? as i64,
                    )),
                    // 128-bit ints: keep the low 64 bits
                    16 => Ok(PlistValue::Integer(
                        read_u64_be_at(self.data, offset + 9).map_err(plist_err)? as i64,
                    )),
                    _ => Err(plist_err(format!("unsupported integer width {}", width))),
                }
            }
            0x2 => match info {
                2 => {
                    let bits = read_uint_be_at(self.data, offset + 1, 4).map_err(plist_err)? as u32;
                    Ok(PlistValue::Real(f32::from_bits(bits) as f64))
                }
                3 => {
                    let bits = read_u64_be_at(self.data, offset + 1).map_err(plist_err)?;
                    Ok(PlistValue::Real(f64::from_bits(bits)))
                }
                _ => Err(plist_err(format!("unsupported real width marker 0x{:02x}", marker))),
            },
            0x3 if info == 0x3 => {
                let bits = read_u64_be_at(self.data, offset + 1).map_err(plist_err)?;
                cocoa_date(f64::from_bits(bits)).map(PlistValue::Date)
            }
            0x4 => {
                let (len, start) = self.length(offset, info)?;
                let bytes = read_bytes_at(self.data, start, len).map_err(plist_err)?;
                Ok(PlistValue::Data(bytes.to_vec()))
            }
            0x5 => {
                let (len, start) = self.length(offset, info)?;
                let bytes = read_bytes_at(self.data, start, len).map_err(plist_err)?;
                Ok(PlistValue::String(String::from_utf8_lossy(bytes).into_owned()))
            }
            0x6 => {
                let (len, start) = self.length(offset, info)?;
                let byte_len = len.checked_mul(2).ok_or_else(|| plist_err("string length overflow"))?;
                let bytes = read_bytes_at(self.data, start, byte_len).map_err(plist_err)?;
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                Ok(PlistValue::String(String::from_utf16_lossy(&units)))
            }
            0x8 => {
                let width = info as usize + 1;
                let uid = read_uint_be_at(self.data, offset + 1, width).map_err(plist_err)?;
                Ok(PlistValue::Integer(uid as i64))
            }
            0xA => {
                let (len, start) = self.length(offset, info)?;
                let refs = self.object_refs(start, len)?;
                let mut items = Vec::with_capacity(refs.len());
                for r in refs {
                    items.push(self.object(r, depth + 1)?);
                }
                Ok(PlistValue::Array(items))
            }
            0xD => {
                let (len, start) = self.length(offset, info)?;
                // Key refs then value refs
                let count = len.checked_mul(2).ok_or_else(|| plist_err("dict length overflow"))?;
                let refs = self.object_refs(start, count)?;
                let (keys, values) = refs.split_at(len);
                let mut entries = Vec::with_capacity(len);
                for (&key_ref, &value_ref) in keys.iter().zip(values) {
                    let key = match self.object(key_ref, depth + 1)? {
                        PlistValue::String(s) => s,
                        _ => return Err(plist_err("dict key is not a string")),
                    };
                    entries.push((key, self.object(value_ref, depth + 1)?));
                }
                Ok(PlistValue::Dict(entries))
            }
            _ => Err(plist_err(format!("unsupported object marker 0x{:02x}", marker))),
        }
    }
}

/// Seconds since 2001-01-01 to a UTC timestamp
fn cocoa_date(seconds: f64) -> Result<DateTime<Utc>, SourceError> {
    if !seconds.is_finite() {
        return Err(plist_err("non-finite date"));
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9) as u32;
    (whole as i64)
        .checked_add(COCOA_EPOCH_OFFSET)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, nanos))
        .ok_or_else(|| plist_err("date out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Document from object bodies, 1-byte offsets and refs, object 0 on top
    fn bplist(objects: &[Vec<u8>]) -> Vec<u8> {
        let mut data = BPLIST_MAGIC.to_vec();
        let mut offsets = Vec::new();
        for object in objects {
            offsets.push(data.len() as u8);
            data.extend_from_slice(object);
        }
        let offset_table = data.len() as u64;
        data.extend_from_slice(&offsets);
        data.extend_from_slice(&[0, 0, 0, 0, 0, 0, 1, 1]);
        data.extend_from_slice(&(offsets.len() as u64).to_be_bytes());
        data.extend_from_slice(&0u64.to_be_bytes());
        data.extend_from_slice(&offset_table.to_be_bytes());
        data
    }

    /// {"a": 1, "b": "hi", "when": <date 0.0>}
    fn sample() -> Vec<u8> {
        let mut date = vec![0x33];
        date.extend_from_slice(&0f64.to_bits().to_be_bytes());
        bplist(&[
            vec![0xD3, 1, 2, 3, 4, 5, 6],
            vec![0x51, b'a'],
            vec![0x51, b'b'],
            vec![0x54, b'w', b'h', b'e', b'n'],
            vec![0x10, 0x01],
            vec![0x52, b'h', b'i'],
            date,
        ])
    }

    #[test]
    fn test_parse_dict() {
        let doc = parse_binary(&sample()).unwrap();
        assert_eq!(doc.get("a"), Some(&PlistValue::Integer(1)));
        assert_eq!(doc.get("b"), Some(&PlistValue::String("hi".into())));
        match doc.get("when") {
            Some(PlistValue::Date(d)) => assert_eq!(d.timestamp(), COCOA_EPOCH_OFFSET),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rejects_truncated() {
        let data = sample();
        assert!(parse_binary(&data[..20]).is_err());
        assert!(parse_binary(b"bplist0").is_err());
        assert!(parse_binary(b"<?xml").is_err());
    }

    #[test]
    fn test_rejects_oversized_lengths() {
        // Dict whose length int is u64::MAX
        let mut huge = vec![0xDF, 0x13];
        huge.extend_from_slice(&u64::MAX.to_be_bytes());
        assert!(matches!(parse_binary(&bplist(&[huge])), Err(SourceError::Plist(_))));

        // Array claiming 255 refs with only two present
        let short = bplist(&[vec![0xAF, 0x10, 0xFF, 1, 1], vec![0x10, 0x07]]);
        assert!(matches!(parse_binary(&short), Err(SourceError::Plist(_))));

        // Date far outside the representable range
        let mut date = vec![0x33];
        date.extend_from_slice(&1e300f64.to_bits().to_be_bytes());
        assert!(parse_binary(&bplist(&[date])).is_err());
    }

    #[test]
    fn test_rejects_bad_trailer_sizes() {
        let mut data = sample();
        let t = data.len() - TRAILER_SIZE;
        data[t + 7] = 0;
        assert!(parse_binary(&data).is_err());

        let mut data = sample();
        let t = data.len() - TRAILER_SIZE;
        data[t + 8..t + 16].copy_from_slice(&u64::MAX.to_be_bytes());
        assert!(parse_binary(&data).is_err());
    }

    #[test]
    fn test_shared_reference_chain_is_bounded() {
        // Each array holds two refs to the next, so full expansion is 2^30 values
        let mut objects: Vec<Vec<u8>> = (1..=30u8).map(|next| vec![0xA2, next, next]).collect();
        objects.push(vec![0x10, 0x01]);
        let err = parse_binary(&bplist(&objects)).unwrap_err();
        assert!(err.to_string().contains("too many object references"), "{}", err);
    }

    #[test]
    fn test_shared_keys_within_budget() {
        // Array of dicts reusing one key and one value object
        let mut objects = vec![vec![0xA3, 1, 1, 1], vec![0xD1, 2, 3]];
        objects.push(vec![0x54, b'n', b'a', b'm', b'e']);
        objects.push(vec![0x52, b'o', b'k']);
        match parse_binary(&bplist(&objects)).unwrap() {
            PlistValue::Array(items) => {
                assert_eq!(items.len(), 3);
                assert!(items.iter().all(|d| d.get("name") == Some(&PlistValue::String("ok".into()))));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
