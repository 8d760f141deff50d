//! Record model for the change-data-capture write path.
//!
//! A table row is a positional vector of nullable scalar values matching the
//! table schema. Change records carry a row kind (insert / update-before /
//! update-after / delete) and a sequence number that is monotonic within a
//! primary key.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A scalar table value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl Datum {
    /// Compares two datums of the same type. Floats use IEEE-754 total order
    /// so the result is deterministic for NaN.
    pub fn try_cmp(&self, other: &Datum) -> Result<std::cmp::Ordering> {
        match (self, other) {
            (Datum::Bool(a), Datum::Bool(b)) => Ok(a.cmp(b)),
            (Datum::Int(a), Datum::Int(b)) => Ok(a.cmp(b)),
            (Datum::Float(a), Datum::Float(b)) => Ok(a.total_cmp(b)),
            (Datum::String(a), Datum::String(b)) => Ok(a.cmp(b)),
            (Datum::Bytes(a), Datum::Bytes(b)) => Ok(a.cmp(b)),
            (a, b) => Err(Error::InvalidData(format!(
                "cannot compare {a:?} with {b:?}"
            ))),
        }
    }

    /// Interprets the datum as an i64 sequence value.
    pub fn as_sequence(&self) -> Result<i64> {
        match self {
            Datum::Int(v) => Ok(*v),
            other => Err(Error::InvalidData(format!(
                "sequence field must be an integer, got {other:?}"
            ))),
        }
    }
}

/// A positional row; `None` is SQL NULL.
pub type Row = Vec<Option<Datum>>;

/// The change kind of a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowKind {
    Insert,
    UpdateBefore,
    UpdateAfter,
    Delete,
}

impl RowKind {
    pub fn to_byte(self) -> u8 {
        match self {
            RowKind::Insert => 0,
            RowKind::UpdateBefore => 1,
            RowKind::UpdateAfter => 2,
            RowKind::Delete => 3,
        }
    }

    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(RowKind::Insert),
            1 => Ok(RowKind::UpdateBefore),
            2 => Ok(RowKind::UpdateAfter),
            3 => Ok(RowKind::Delete),
            other => Err(Error::InvalidData(format!("invalid row kind byte {other}"))),
        }
    }

    /// True for kinds that remove state: update-before and delete.
    pub fn is_retract(self) -> bool {
        matches!(self, RowKind::UpdateBefore | RowKind::Delete)
    }
}

/// A change record as stored in data files and merged by the LSM tree.
///
/// `key` is the order-preserving encoding of the trimmed primary key (primary
/// key columns minus partition columns), so byte comparison equals typed
/// comparison. `value` is the full table row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub sequence: u64,
    pub kind: RowKind,
    pub value: Row,
}

impl KeyValue {
    pub fn new(key: Vec<u8>, sequence: u64, kind: RowKind, value: Row) -> Self {
        Self {
            key,
            sequence,
            kind,
            value,
        }
    }
}

/// An incoming CDC record before routing: a row plus its change kind.
#[derive(Clone, Debug, PartialEq)]
pub struct CdcRecord {
    pub kind: RowKind,
    pub row: Row,
}

impl CdcRecord {
    pub fn new(kind: RowKind, row: Row) -> Self {
        Self { kind, row }
    }

    pub fn insert(row: Row) -> Self {
        Self::new(RowKind::Insert, row)
    }

    pub fn delete(row: Row) -> Self {
        Self::new(RowKind::Delete, row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_kind_round_trip() -> Result<()> {
        for kind in [
            RowKind::Insert,
            RowKind::UpdateBefore,
            RowKind::UpdateAfter,
            RowKind::Delete,
        ] {
            assert_eq!(RowKind::from_byte(kind.to_byte())?, kind);
        }
        assert!(RowKind::from_byte(9).is_err());
        Ok(())
    }

    #[test]
    fn test_retract_kinds() {
        assert!(!RowKind::Insert.is_retract());
        assert!(!RowKind::UpdateAfter.is_retract());
        assert!(RowKind::UpdateBefore.is_retract());
        assert!(RowKind::Delete.is_retract());
    }

    #[test]
    fn test_datum_compare() -> Result<()> {
        use std::cmp::Ordering;
        assert_eq!(
            Datum::Int(1).try_cmp(&Datum::Int(2))?,
            Ordering::Less
        );
        assert_eq!(
            Datum::String("b".into()).try_cmp(&Datum::String("a".into()))?,
            Ordering::Greater
        );
        assert!(Datum::Int(1).try_cmp(&Datum::Bool(true)).is_err());
        Ok(())
    }
}
