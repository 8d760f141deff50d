//! Filter predicates pushed down by the scan planner.
//!
//! A predicate is a closed tree over row fields. It evaluates in two modes:
//! exactly against a row, and conservatively against per-field statistics
//! (may-match). Both evaluation paths take `&self` and mutate nothing, so a
//! predicate can be shared by the parallel manifest readers.

use crate::data::{Datum, Row};
use crate::encoding::keycode;
use crate::error::Result;
use crate::file::stats::FieldStats;
use crate::hasher;

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Equal { field: usize, value: Datum },
    GreaterThan { field: usize, value: Datum },
    GreaterOrEqual { field: usize, value: Datum },
    LessThan { field: usize, value: Datum },
    LessOrEqual { field: usize, value: Datum },
    IsNull { field: usize },
    IsNotNull { field: usize },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn equal(field: usize, value: Datum) -> Self {
        Predicate::Equal { field, value }
    }

    pub fn and(predicates: Vec<Predicate>) -> Self {
        Predicate::And(predicates)
    }

    pub fn or(predicates: Vec<Predicate>) -> Self {
        Predicate::Or(predicates)
    }

    /// Exact evaluation against a row. SQL three-valued logic collapses to
    /// false for comparisons against NULL.
    pub fn test_row(&self, row: &Row) -> Result<bool> {
        Ok(match self {
            Predicate::Equal { field, value } => match &row[*field] {
                Some(actual) => actual.try_cmp(value)?.is_eq(),
                None => false,
            },
            Predicate::GreaterThan { field, value } => match &row[*field] {
                Some(actual) => actual.try_cmp(value)?.is_gt(),
                None => false,
            },
            Predicate::GreaterOrEqual { field, value } => match &row[*field] {
                Some(actual) => actual.try_cmp(value)?.is_ge(),
                None => false,
            },
            Predicate::LessThan { field, value } => match &row[*field] {
                Some(actual) => actual.try_cmp(value)?.is_lt(),
                None => false,
            },
            Predicate::LessOrEqual { field, value } => match &row[*field] {
                Some(actual) => actual.try_cmp(value)?.is_le(),
                None => false,
            },
            Predicate::IsNull { field } => row[*field].is_none(),
            Predicate::IsNotNull { field } => row[*field].is_some(),
            Predicate::And(children) => {
                for child in children {
                    if !child.test_row(row)? {
                        return Ok(false);
                    }
                }
                true
            }
            Predicate::Or(children) => {
                for child in children {
                    if child.test_row(row)? {
                        return Ok(true);
                    }
                }
                false
            }
        })
    }

    /// Conservative evaluation against field statistics: false means no row
    /// in the file can match; true means a row may match.
    pub fn test_stats(&self, stats: &[FieldStats], row_count: u64) -> Result<bool> {
        let bounds = |field: usize| -> Option<(&Datum, &Datum)> {
            let s = stats.get(field)?;
            match (&s.min, &s.max) {
                (Some(min), Some(max)) => Some((min, max)),
                _ => None,
            }
        };
        Ok(match self {
            Predicate::Equal { field, value } => match bounds(*field) {
                Some((min, max)) => {
                    min.try_cmp(value)?.is_le() && max.try_cmp(value)?.is_ge()
                }
                None => true,
            },
            Predicate::GreaterThan { field, value } => match bounds(*field) {
                Some((_, max)) => max.try_cmp(value)?.is_gt(),
                None => true,
            },
            Predicate::GreaterOrEqual { field, value } => match bounds(*field) {
                Some((_, max)) => max.try_cmp(value)?.is_ge(),
                None => true,
            },
            Predicate::LessThan { field, value } => match bounds(*field) {
                Some((min, _)) => min.try_cmp(value)?.is_lt(),
                None => true,
            },
            Predicate::LessOrEqual { field, value } => match bounds(*field) {
                Some((min, _)) => min.try_cmp(value)?.is_le(),
                None => true,
            },
            Predicate::IsNull { field } => stats
                .get(*field)
                .map_or(true, |s| s.null_count > 0),
            Predicate::IsNotNull { field } => stats
                .get(*field)
                .map_or(true, |s| s.null_count < row_count),
            Predicate::And(children) => {
                for child in children {
                    if !child.test_stats(stats, row_count)? {
                        return Ok(false);
                    }
                }
                true
            }
            Predicate::Or(children) => {
                if children.is_empty() {
                    return Ok(false);
                }
                for child in children {
                    if child.test_stats(stats, row_count)? {
                        return Ok(true);
                    }
                }
                false
            }
        })
    }
}

/// Narrows a scan to the buckets that can contain rows matching equality
/// predicates over the full bucket key.
///
/// Built once before planning; `select` is pure so it is safe to call from
/// the parallel manifest readers.
#[derive(Clone, Debug)]
pub struct BucketSelector {
    hashes: Vec<u64>,
}

impl BucketSelector {
    /// Extracts complete bucket-key assignments from the predicate. Returns
    /// `None` when the predicate does not pin every bucket-key column, in
    /// which case no bucket can be excluded.
    pub fn create(predicate: &Predicate, bucket_key_fields: &[usize]) -> Option<Self> {
        let assignments = collect_assignments(predicate, bucket_key_fields)?;
        if assignments.is_empty() {
            return None;
        }
        let hashes = assignments
            .into_iter()
            .map(|values| {
                hasher::bucket_hash(&keycode::encode_fields(
                    values.iter().map(|v| Some(v)),
                ))
            })
            .collect();
        Some(Self { hashes })
    }

    pub fn select(&self, bucket: u32, total_buckets: u32) -> bool {
        if total_buckets == 0 {
            // Dynamic-bucket layout: placement is index-driven, nothing to
            // derive from the hash.
            return true;
        }
        self.hashes
            .iter()
            .any(|&hash| hasher::bucket_of(hash, total_buckets) == bucket)
    }
}

/// Returns the candidate bucket-key value tuples implied by the predicate,
/// or `None` when the predicate cannot be reduced to full assignments.
fn collect_assignments(
    predicate: &Predicate,
    bucket_key_fields: &[usize],
) -> Option<Vec<Vec<Datum>>> {
    match predicate {
        Predicate::Equal { field, value } => {
            if bucket_key_fields == [*field] {
                Some(vec![vec![value.clone()]])
            } else {
                None
            }
        }
        Predicate::And(children) => {
            let mut values: Vec<Option<Datum>> = vec![None; bucket_key_fields.len()];
            for child in children {
                if let Predicate::Equal { field, value } = child {
                    if let Some(pos) = bucket_key_fields.iter().position(|f| f == field) {
                        values[pos] = Some(value.clone());
                    }
                }
            }
            let complete: Option<Vec<Datum>> = values.into_iter().collect();
            complete.map(|v| vec![v])
        }
        Predicate::Or(children) => {
            let mut all = Vec::new();
            for child in children {
                all.extend(collect_assignments(child, bucket_key_fields)?);
            }
            Some(all)
        }
        _ => None,
    }
}
