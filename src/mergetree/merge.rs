//! Per-key reducers applied during compaction and read-time merging.
//!
//! The engine variants form a closed set; each exposes `reset`, `add` and
//! `result`. `add` is called with every version of one key in ascending
//! sequence order (the loser tree guarantees the clustering), and `result`
//! yields at most one logical record for the key.

use std::collections::HashMap;

use crate::config::{CoreOptions, MergeEngine};
use crate::data::{Datum, KeyValue, Row, RowKind};
use crate::errinput;
use crate::error::{Error, Result};
use crate::schema::TableSchema;

/// Reads a per-group sequence value from a row field.
///
/// A group's sequence gates updates of its member fields: a member only
/// updates when the incoming group sequence is not behind the accumulated
/// one. A `None` sequence never wins.
#[derive(Clone, Debug)]
pub struct SequenceGenerator {
    index: usize,
}

impl SequenceGenerator {
    pub fn new(field: &str, schema: &TableSchema) -> Result<Self> {
        let index = schema.field_index(field).ok_or_else(|| {
            Error::InvalidInput(format!("sequence field {field:?} not found in schema"))
        })?;
        Ok(Self { index })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generate_nullable(&self, row: &Row) -> Result<Option<i64>> {
        row[self.index]
            .as_ref()
            .map(|datum| datum.as_sequence())
            .transpose()
    }
}

/// Per-column fold used by the aggregate engine.
#[derive(Clone, Debug)]
pub enum FieldAggregator {
    Sum,
    Max,
    Min,
    LastValue,
    LastNonNull,
    FirstNonNull,
    ListAgg { delimiter: String },
}

impl FieldAggregator {
    fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "sum" => FieldAggregator::Sum,
            "max" => FieldAggregator::Max,
            "min" => FieldAggregator::Min,
            "last_value" => FieldAggregator::LastValue,
            "last_non_null_value" => FieldAggregator::LastNonNull,
            "first_non_null_value" => FieldAggregator::FirstNonNull,
            "listagg" => FieldAggregator::ListAgg {
                delimiter: ",".to_string(),
            },
            other => {
                return Err(Error::InvalidInput(format!(
                    "unknown aggregate function {other:?}"
                )))
            }
        })
    }

    fn fold(&self, accumulated: &mut Option<Datum>, incoming: Option<&Datum>) -> Result<()> {
        match self {
            FieldAggregator::Sum => {
                if let Some(incoming) = incoming {
                    *accumulated = Some(match accumulated.take() {
                        None => incoming.clone(),
                        Some(Datum::Int(a)) => match incoming {
                            Datum::Int(b) => Datum::Int(a + b),
                            other => {
                                return Err(Error::InvalidData(format!(
                                    "sum over mixed types: {other:?}"
                                )))
                            }
                        },
                        Some(Datum::Float(a)) => match incoming {
                            Datum::Float(b) => Datum::Float(a + b),
                            other => {
                                return Err(Error::InvalidData(format!(
                                    "sum over mixed types: {other:?}"
                                )))
                            }
                        },
                        Some(other) => {
                            return Err(Error::InvalidData(format!(
                                "sum over non-numeric type: {other:?}"
                            )))
                        }
                    });
                }
            }
            FieldAggregator::Max => {
                if let Some(incoming) = incoming {
                    match accumulated {
                        Some(current) if incoming.try_cmp(current)?.is_le() => {}
                        _ => *accumulated = Some(incoming.clone()),
                    }
                }
            }
            FieldAggregator::Min => {
                if let Some(incoming) = incoming {
                    match accumulated {
                        Some(current) if incoming.try_cmp(current)?.is_ge() => {}
                        _ => *accumulated = Some(incoming.clone()),
                    }
                }
            }
            FieldAggregator::LastValue => *accumulated = incoming.cloned(),
            FieldAggregator::LastNonNull => {
                if incoming.is_some() {
                    *accumulated = incoming.cloned();
                }
            }
            FieldAggregator::FirstNonNull => {
                if accumulated.is_none() {
                    *accumulated = incoming.cloned();
                }
            }
            FieldAggregator::ListAgg { delimiter } => {
                if let Some(incoming) = incoming {
                    let incoming = match incoming {
                        Datum::String(s) => s.clone(),
                        other => {
                            return Err(Error::InvalidData(format!(
                                "listagg over non-string type: {other:?}"
                            )))
                        }
                    };
                    *accumulated = Some(match accumulated.take() {
                        Some(Datum::String(mut current)) => {
                            current.push_str(delimiter);
                            current.push_str(&incoming);
                            Datum::String(current)
                        }
                        _ => Datum::String(incoming),
                    });
                }
            }
        }
        Ok(())
    }
}

/// The closed set of merge engines.
pub enum MergeFunction {
    /// Keep the record with the highest sequence; a delete wins over an
    /// insert at equal sequence.
    Deduplicate { latest: Option<KeyValue> },
    /// Fold non-null fields of successive records into the accumulator.
    PartialUpdate {
        ignore_delete: bool,
        /// field index -> sequence generator of its governing group.
        field_groups: HashMap<usize, SequenceGenerator>,
        arity: usize,
        row: Row,
        latest: Option<(Vec<u8>, u64)>,
    },
    /// Keep the earliest record per key, drop the rest.
    FirstRow { first: Option<KeyValue> },
    /// Fold every column through its configured aggregator.
    Aggregate {
        aggregators: Vec<FieldAggregator>,
        row: Row,
        latest: Option<(Vec<u8>, u64)>,
    },
}

impl MergeFunction {
    pub fn create(options: &CoreOptions, schema: &TableSchema) -> Result<Self> {
        let arity = schema.fields.len();
        Ok(match options.merge_engine {
            MergeEngine::Deduplicate => MergeFunction::Deduplicate { latest: None },
            MergeEngine::FirstRow => MergeFunction::FirstRow { first: None },
            MergeEngine::PartialUpdate => {
                let mut field_groups = HashMap::new();
                for (sequence_field, members) in &options.sequence_groups {
                    let generator = SequenceGenerator::new(sequence_field, schema)?;
                    for member in members {
                        let index = schema.field_index(member).ok_or_else(|| {
                            Error::InvalidInput(format!(
                                "sequence group member {member:?} not found in schema"
                            ))
                        })?;
                        if field_groups.insert(index, generator.clone()).is_some() {
                            return Err(Error::InvalidInput(format!(
                                "field {member:?} is defined by multiple sequence groups"
                            )));
                        }
                    }
                    // The sequence field governs itself.
                    field_groups.insert(generator.index(), generator.clone());
                }
                MergeFunction::PartialUpdate {
                    ignore_delete: options.partial_update_ignore_delete,
                    field_groups,
                    arity,
                    row: vec![None; arity],
                    latest: None,
                }
            }
            MergeEngine::Aggregate => {
                let mut aggregators = vec![FieldAggregator::LastNonNull; arity];
                for key in schema.primary_keys.iter().chain(&schema.partition_keys) {
                    if let Some(index) = schema.field_index(key) {
                        aggregators[index] = FieldAggregator::LastValue;
                    }
                }
                for (field, function) in &options.field_aggregates {
                    let index = schema.field_index(field).ok_or_else(|| {
                        Error::InvalidInput(format!(
                            "aggregate field {field:?} not found in schema"
                        ))
                    })?;
                    aggregators[index] = FieldAggregator::from_name(function)?;
                }
                MergeFunction::Aggregate {
                    aggregators,
                    row: vec![None; arity],
                    latest: None,
                }
            }
        })
    }

    pub fn reset(&mut self) {
        match self {
            MergeFunction::Deduplicate { latest } => *latest = None,
            MergeFunction::FirstRow { first } => *first = None,
            MergeFunction::PartialUpdate {
                row, latest, arity, ..
            } => {
                *row = vec![None; *arity];
                *latest = None;
            }
            MergeFunction::Aggregate { row, latest, .. } => {
                for field in row.iter_mut() {
                    *field = None;
                }
                *latest = None;
            }
        }
    }

    pub fn add(&mut self, kv: KeyValue) -> Result<()> {
        match self {
            MergeFunction::Deduplicate { latest } => {
                let replace = match latest {
                    None => true,
                    Some(current) => {
                        kv.sequence > current.sequence
                            || (kv.sequence == current.sequence && kv.kind == RowKind::Delete)
                    }
                };
                if replace {
                    *latest = Some(kv);
                }
                Ok(())
            }
            MergeFunction::FirstRow { first } => {
                if kv.kind.is_retract() {
                    return Ok(());
                }
                if first.is_none() {
                    *first = Some(kv);
                }
                Ok(())
            }
            MergeFunction::PartialUpdate {
                ignore_delete,
                field_groups,
                row,
                latest,
                ..
            } => {
                if kv.kind.is_retract() {
                    if *ignore_delete {
                        return Ok(());
                    }
                    if kv.kind == RowKind::UpdateBefore {
                        return errinput!("partial-update cannot accept update-before records");
                    }
                    return errinput!("partial-update cannot accept delete records");
                }

                *latest = Some((kv.key.clone(), kv.sequence));
                if field_groups.is_empty() {
                    for (accumulated, incoming) in row.iter_mut().zip(&kv.value) {
                        if incoming.is_some() {
                            *accumulated = incoming.clone();
                        }
                    }
                    return Ok(());
                }
                for index in 0..row.len() {
                    match field_groups.get(&index) {
                        None => {
                            if kv.value[index].is_some() {
                                row[index] = kv.value[index].clone();
                            }
                        }
                        Some(generator) => {
                            let Some(current) = generator.generate_nullable(&kv.value)? else {
                                continue;
                            };
                            let previous = generator.generate_nullable(row)?;
                            if previous.map_or(true, |p| current >= p) {
                                row[index] = kv.value[index].clone();
                            }
                        }
                    }
                }
                Ok(())
            }
            MergeFunction::Aggregate {
                aggregators,
                row,
                latest,
            } => {
                if kv.kind.is_retract() {
                    return errinput!("aggregate merge cannot accept retract records");
                }
                *latest = Some((kv.key.clone(), kv.sequence));
                for (index, aggregator) in aggregators.iter().enumerate() {
                    let mut accumulated = row[index].take();
                    aggregator.fold(&mut accumulated, kv.value[index].as_ref())?;
                    row[index] = accumulated;
                }
                Ok(())
            }
        }
    }

    /// Yields the merged record, or `None` when every input was dropped.
    pub fn result(&mut self) -> Result<Option<KeyValue>> {
        match self {
            MergeFunction::Deduplicate { latest } => Ok(latest.take()),
            MergeFunction::FirstRow { first } => Ok(first.take()),
            MergeFunction::PartialUpdate { row, latest, .. } => match latest.take() {
                None => Ok(None),
                Some((key, sequence)) => Ok(Some(KeyValue::new(
                    key,
                    sequence,
                    RowKind::Insert,
                    std::mem::take(row),
                ))),
            },
            MergeFunction::Aggregate { row, latest, .. } => match latest.take() {
                None => Ok(None),
                Some((key, sequence)) => Ok(Some(KeyValue::new(
                    key,
                    sequence,
                    RowKind::Insert,
                    row.clone(),
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DataType;
    use std::collections::BTreeMap;

    fn schema(fields: Vec<(&str, DataType)>) -> Result<TableSchema> {
        TableSchema::new(fields, vec![], vec!["k"], BTreeMap::new())
    }

    fn kv(seq: u64, kind: RowKind, value: Row) -> KeyValue {
        KeyValue::new(vec![1], seq, kind, value)
    }

    #[test]
    fn test_deduplicate_highest_sequence_wins() -> Result<()> {
        let schema = schema(vec![("k", DataType::Int), ("v", DataType::Int)])?;
        let options = CoreOptions::default();
        let mut merge = MergeFunction::create(&options, &schema)?;

        merge.reset();
        merge.add(kv(1, RowKind::Insert, vec![Some(Datum::Int(1)), Some(Datum::Int(10))]))?;
        merge.add(kv(2, RowKind::Insert, vec![Some(Datum::Int(1)), Some(Datum::Int(20))]))?;
        let result = merge.result()?.unwrap();
        assert_eq!(result.sequence, 2);
        assert_eq!(result.value[1], Some(Datum::Int(20)));
        Ok(())
    }

    #[test]
    fn test_deduplicate_delete_wins_at_equal_sequence() -> Result<()> {
        let schema = schema(vec![("k", DataType::Int), ("v", DataType::Int)])?;
        let mut merge = MergeFunction::create(&CoreOptions::default(), &schema)?;

        merge.reset();
        merge.add(kv(5, RowKind::Insert, vec![Some(Datum::Int(1)), Some(Datum::Int(10))]))?;
        merge.add(kv(5, RowKind::Delete, vec![Some(Datum::Int(1)), None]))?;
        assert_eq!(merge.result()?.unwrap().kind, RowKind::Delete);
        Ok(())
    }

    #[test]
    fn test_partial_update_folds_non_null() -> Result<()> {
        let schema = schema(vec![
            ("k", DataType::Int),
            ("a", DataType::String),
            ("b", DataType::String),
        ])?;
        let options = CoreOptions::default().with_merge_engine(MergeEngine::PartialUpdate);
        let mut merge = MergeFunction::create(&options, &schema)?;

        merge.reset();
        merge.add(kv(
            1,
            RowKind::Insert,
            vec![Some(Datum::Int(1)), Some(Datum::String("x".into())), None],
        ))?;
        merge.add(kv(
            2,
            RowKind::Insert,
            vec![Some(Datum::Int(1)), None, Some(Datum::String("y".into()))],
        ))?;
        let result = merge.result()?.unwrap();
        assert_eq!(result.kind, RowKind::Insert);
        assert_eq!(result.value[1], Some(Datum::String("x".into())));
        assert_eq!(result.value[2], Some(Datum::String("y".into())));
        Ok(())
    }

    #[test]
    fn test_partial_update_rejects_delete_unless_ignored() -> Result<()> {
        let schema = schema(vec![("k", DataType::Int), ("a", DataType::Int)])?;
        let options = CoreOptions::default().with_merge_engine(MergeEngine::PartialUpdate);
        let mut merge = MergeFunction::create(&options, &schema)?;
        merge.reset();
        assert!(merge
            .add(kv(1, RowKind::Delete, vec![Some(Datum::Int(1)), None]))
            .is_err());

        let mut ignoring = options.clone();
        ignoring.partial_update_ignore_delete = true;
        let mut merge = MergeFunction::create(&ignoring, &schema)?;
        merge.reset();
        merge.add(kv(1, RowKind::Delete, vec![Some(Datum::Int(1)), None]))?;
        assert!(merge.result()?.is_none());
        Ok(())
    }

    #[test]
    fn test_partial_update_sequence_groups() -> Result<()> {
        // Schema (k, g1, a, g2, b) with groups g1 -> a and g2 -> b.
        let schema = schema(vec![
            ("k", DataType::Int),
            ("g1", DataType::Int),
            ("a", DataType::String),
            ("g2", DataType::Int),
            ("b", DataType::String),
        ])?;
        let mut options = CoreOptions::default().with_merge_engine(MergeEngine::PartialUpdate);
        options.sequence_groups = vec![
            ("g1".to_string(), vec!["a".to_string()]),
            ("g2".to_string(), vec!["b".to_string()]),
        ];
        let mut merge = MergeFunction::create(&options, &schema)?;

        merge.reset();
        merge.add(kv(
            1,
            RowKind::Insert,
            vec![
                Some(Datum::Int(1)),
                Some(Datum::Int(10)),
                Some(Datum::String("A".into())),
                Some(Datum::Int(5)),
                Some(Datum::String("X".into())),
            ],
        ))?;
        merge.add(kv(
            2,
            RowKind::Insert,
            vec![
                Some(Datum::Int(1)),
                Some(Datum::Int(5)),
                Some(Datum::String("A'".into())),
                Some(Datum::Int(10)),
                Some(Datum::String("Y".into())),
            ],
        ))?;

        let result = merge.result()?.unwrap();
        assert_eq!(result.value[1], Some(Datum::Int(10)));
        assert_eq!(result.value[2], Some(Datum::String("A".into())));
        assert_eq!(result.value[3], Some(Datum::Int(10)));
        assert_eq!(result.value[4], Some(Datum::String("Y".into())));
        Ok(())
    }

    #[test]
    fn test_first_row_keeps_earliest() -> Result<()> {
        let schema = schema(vec![("k", DataType::Int), ("v", DataType::Int)])?;
        let options = CoreOptions::default().with_merge_engine(MergeEngine::FirstRow);
        let mut merge = MergeFunction::create(&options, &schema)?;

        merge.reset();
        merge.add(kv(1, RowKind::Insert, vec![Some(Datum::Int(1)), Some(Datum::Int(10))]))?;
        merge.add(kv(2, RowKind::Insert, vec![Some(Datum::Int(1)), Some(Datum::Int(20))]))?;
        let result = merge.result()?.unwrap();
        assert_eq!(result.sequence, 1);
        assert_eq!(result.value[1], Some(Datum::Int(10)));
        Ok(())
    }

    #[test]
    fn test_aggregate_folds_columns() -> Result<()> {
        let schema = schema(vec![
            ("k", DataType::Int),
            ("total", DataType::Int),
            ("hi", DataType::Int),
            ("note", DataType::String),
        ])?;
        let mut options = CoreOptions::default().with_merge_engine(MergeEngine::Aggregate);
        options.field_aggregates = vec![
            ("total".to_string(), "sum".to_string()),
            ("hi".to_string(), "max".to_string()),
            ("note".to_string(), "listagg".to_string()),
        ];
        let mut merge = MergeFunction::create(&options, &schema)?;

        merge.reset();
        merge.add(kv(
            1,
            RowKind::Insert,
            vec![
                Some(Datum::Int(1)),
                Some(Datum::Int(3)),
                Some(Datum::Int(7)),
                Some(Datum::String("a".into())),
            ],
        ))?;
        merge.add(kv(
            2,
            RowKind::Insert,
            vec![
                Some(Datum::Int(1)),
                Some(Datum::Int(4)),
                Some(Datum::Int(2)),
                Some(Datum::String("b".into())),
            ],
        ))?;

        let result = merge.result()?.unwrap();
        assert_eq!(result.value[1], Some(Datum::Int(7)));
        assert_eq!(result.value[2], Some(Datum::Int(7)));
        assert_eq!(result.value[3], Some(Datum::String("a,b".into())));
        Ok(())
    }
}
