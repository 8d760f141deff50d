//! Order-preserving binary encoding for keys and partition values.
//!
//! Encoded byte slices compare lexicographically in the same order as the
//! typed values they encode, which lets the merge tree, the sort buffer and
//! the index store compare keys as plain `&[u8]`. Composite rows concatenate
//! field encodings; every field encoding is self-delimiting so composite
//! ordering is field-by-field.

use crate::data::{Datum, Row};
use crate::error::{Error, Result};

// Type prefixes. Order matters: nulls sort first, then by type tag.
const TYPE_NULL: u8 = 0x00;
const TYPE_BOOLEAN: u8 = 0x01;
const TYPE_INTEGER: u8 = 0x02;
const TYPE_FLOAT: u8 = 0x03;
const TYPE_STRING: u8 = 0x04;
const TYPE_BYTES: u8 = 0x05;

/// Appends the order-preserving encoding of one nullable datum.
pub fn encode_datum(buf: &mut Vec<u8>, datum: Option<&Datum>) {
    match datum {
        None => buf.push(TYPE_NULL),
        Some(Datum::Bool(b)) => {
            buf.push(TYPE_BOOLEAN);
            buf.push(if *b { 0x01 } else { 0x00 });
        }
        Some(Datum::Int(i)) => {
            // Flip the sign bit so negative numbers sort before positive.
            buf.push(TYPE_INTEGER);
            buf.extend_from_slice(&((*i as u64) ^ (1u64 << 63)).to_be_bytes());
        }
        Some(Datum::Float(f)) => {
            // IEEE 754: negative values flip all bits, positive flip the sign.
            let bits = f.to_bits();
            let ordered = if bits & (1u64 << 63) != 0 {
                !bits
            } else {
                bits | (1u64 << 63)
            };
            buf.push(TYPE_FLOAT);
            buf.extend_from_slice(&ordered.to_be_bytes());
        }
        Some(Datum::String(s)) => {
            buf.push(TYPE_STRING);
            encode_escaped(buf, s.as_bytes());
        }
        Some(Datum::Bytes(b)) => {
            buf.push(TYPE_BYTES);
            encode_escaped(buf, b);
        }
    }
}

/// Escapes 0x00 as 0x00 0xFF and terminates with 0x00 0x00, preserving order
/// for variable-length fields inside composite keys.
fn encode_escaped(buf: &mut Vec<u8>, bytes: &[u8]) {
    for &byte in bytes {
        if byte == 0x00 {
            buf.extend_from_slice(&[0x00, 0xff]);
        } else {
            buf.push(byte);
        }
    }
    buf.extend_from_slice(&[0x00, 0x00]);
}

fn decode_escaped(buf: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    let mut result = Vec::new();
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(truncated)?;
        *pos += 1;
        if byte != 0x00 {
            result.push(byte);
            continue;
        }
        match buf.get(*pos) {
            Some(0xff) => {
                result.push(0x00);
                *pos += 1;
            }
            Some(0x00) => {
                *pos += 1;
                return Ok(result);
            }
            _ => return Err(Error::InvalidData("invalid escape in key".to_string())),
        }
    }
}

/// Decodes one nullable datum, advancing `pos`.
pub fn decode_datum(buf: &[u8], pos: &mut usize) -> Result<Option<Datum>> {
    let tag = *buf.get(*pos).ok_or_else(truncated)?;
    *pos += 1;
    match tag {
        TYPE_NULL => Ok(None),
        TYPE_BOOLEAN => {
            let b = *buf.get(*pos).ok_or_else(truncated)?;
            *pos += 1;
            match b {
                0x00 => Ok(Some(Datum::Bool(false))),
                0x01 => Ok(Some(Datum::Bool(true))),
                _ => Err(Error::InvalidData("invalid boolean byte".to_string())),
            }
        }
        TYPE_INTEGER => {
            let raw = read_u64(buf, pos)?;
            Ok(Some(Datum::Int((raw ^ (1u64 << 63)) as i64)))
        }
        TYPE_FLOAT => {
            let ordered = read_u64(buf, pos)?;
            let bits = if ordered & (1u64 << 63) != 0 {
                ordered & !(1u64 << 63)
            } else {
                !ordered
            };
            Ok(Some(Datum::Float(f64::from_bits(bits))))
        }
        TYPE_STRING => {
            let bytes = decode_escaped(buf, pos)?;
            let s = String::from_utf8(bytes)
                .map_err(|_| Error::InvalidData("invalid utf8 in key".to_string()))?;
            Ok(Some(Datum::String(s)))
        }
        TYPE_BYTES => Ok(Some(Datum::Bytes(decode_escaped(buf, pos)?))),
        other => Err(Error::InvalidData(format!("invalid key type tag {other}"))),
    }
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let end = *pos + 8;
    let slice = buf.get(*pos..end).ok_or_else(truncated)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(slice);
    *pos = end;
    Ok(u64::from_be_bytes(raw))
}

fn truncated() -> Error {
    Error::InvalidData("truncated key encoding".to_string())
}

/// Encodes the given row fields, in order, into one composite key.
pub fn encode_fields<'a>(fields: impl IntoIterator<Item = Option<&'a Datum>>) -> Vec<u8> {
    let mut buf = Vec::new();
    for field in fields {
        encode_datum(&mut buf, field);
    }
    buf
}

/// Encodes a projection of `row` by field indices.
pub fn encode_projected(row: &Row, indices: &[usize]) -> Vec<u8> {
    encode_fields(indices.iter().map(|&i| row[i].as_ref()))
}

/// Decodes a composite key of `arity` fields back into a row.
pub fn decode_fields(buf: &[u8], arity: usize) -> Result<Row> {
    let mut pos = 0;
    let mut row = Vec::with_capacity(arity);
    for _ in 0..arity {
        row.push(decode_datum(buf, &mut pos)?);
    }
    if pos != buf.len() {
        return Err(Error::InvalidData(
            "trailing bytes after key fields".to_string(),
        ));
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_one(datum: Option<&Datum>) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_datum(&mut buf, datum);
        buf
    }

    #[test]
    fn test_integer_ordering() {
        let values = [i64::MIN, -100, -1, 0, 1, 42, i64::MAX];
        let encoded: Vec<_> = values
            .iter()
            .map(|v| encode_one(Some(&Datum::Int(*v))))
            .collect();
        for pair in encoded.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_float_ordering() {
        let values = [f64::NEG_INFINITY, -1.5, -0.0, 0.0, 0.25, 7.0, f64::INFINITY];
        let encoded: Vec<_> = values
            .iter()
            .map(|v| encode_one(Some(&Datum::Float(*v))))
            .collect();
        for pair in encoded.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn test_string_embedded_null_ordering() {
        let a = encode_one(Some(&Datum::String("a".to_string())));
        let b = encode_one(Some(&Datum::String("a\0b".to_string())));
        let c = encode_one(Some(&Datum::String("ab".to_string())));
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_null_sorts_first() {
        let null = encode_one(None);
        let zero = encode_one(Some(&Datum::Int(i64::MIN)));
        assert!(null < zero);
    }

    #[test]
    fn test_composite_round_trip() -> Result<()> {
        let row: Row = vec![
            Some(Datum::Int(7)),
            None,
            Some(Datum::String("part-a".to_string())),
            Some(Datum::Bytes(vec![0, 1, 0, 2])),
            Some(Datum::Bool(true)),
        ];
        let encoded = encode_fields(row.iter().map(|f| f.as_ref()));
        let decoded = decode_fields(&encoded, row.len())?;
        assert_eq!(decoded, row);
        Ok(())
    }

    #[test]
    fn test_composite_ordering_field_by_field() {
        let ab = encode_fields([Some(&Datum::String("a".to_string())), Some(&Datum::Int(2))]);
        let b = encode_fields([Some(&Datum::String("b".to_string())), Some(&Datum::Int(1))]);
        assert!(ab < b);
    }
}
