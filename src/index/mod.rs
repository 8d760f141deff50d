//! Global primary-key index and dynamic bucket assignment.
//!
//! Tables whose primary key does not cover the partition key enforce
//! uniqueness across partitions here: every key maps to its owning
//! (partition-id, bucket) in an embedded KV store, and a record arriving for
//! a different partition is resolved by the merge engine's exists-action —
//! retract-and-move for deduplicate, keep-old-partition for partial-update
//! and aggregate, drop for first-row.
//!
//! Assigners shard by bucket: with `M` assigners, shard `s` owns bucket `b`
//! iff `b % M == s`, so each shard's KV store and bucket set are disjoint.

pub mod kv;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::config::{CoreOptions, MergeEngine};
use crate::data::{CdcRecord, RowKind};
use crate::encoding::{read_varint, write_varint};
use crate::errdata;
use crate::error::{Error, Result};
use crate::memory::MemoryPool;
use crate::schema::TableSchema;
use crate::sort::BinaryExternalSortBuffer;

pub use kv::IndexKv;

/// How to treat a key that already lives in a different partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExistsAction {
    /// Retract from the old location, insert at the new one.
    Delete,
    /// Rewrite the record onto the old partition.
    UseOld,
    /// Drop the record.
    SkipNew,
}

impl ExistsAction {
    pub fn from_merge_engine(engine: MergeEngine) -> Self {
        match engine {
            MergeEngine::Deduplicate => ExistsAction::Delete,
            MergeEngine::PartialUpdate | MergeEngine::Aggregate => ExistsAction::UseOld,
            MergeEngine::FirstRow => ExistsAction::SkipNew,
        }
    }
}

/// Dense integer ids for partition payloads: an append-only arena plus a
/// reverse index, so the KV store stores a varint instead of the payload.
#[derive(Debug, Default)]
pub struct IdMapping {
    ids: HashMap<Vec<u8>, u32>,
    rows: Vec<Vec<u8>>,
}

impl IdMapping {
    pub fn index(&mut self, partition: &[u8]) -> u32 {
        if let Some(&id) = self.ids.get(partition) {
            return id;
        }
        let id = self.rows.len() as u32;
        self.rows.push(partition.to_vec());
        self.ids.insert(partition.to_vec(), id);
        id
    }

    pub fn get(&self, id: u32) -> Option<&[u8]> {
        self.rows.get(id as usize).map(|row| row.as_slice())
    }
}

/// Per-partition bucket loads for dynamic assignment.
///
/// Buckets iterate in ascending id order, so assignment is deterministic
/// given the bootstrap counts: the first shard-owned bucket below the target
/// row count wins, else the smallest unused shard-owned id is opened.
#[derive(Debug, Default)]
pub struct BucketAssigner {
    stats: HashMap<Vec<u8>, BTreeMap<u32, u64>>,
}

impl BucketAssigner {
    pub fn bootstrap_bucket(&mut self, partition: &[u8], bucket: u32) {
        *self
            .stats
            .entry(partition.to_vec())
            .or_default()
            .entry(bucket)
            .or_insert(0) += 1;
    }

    pub fn assign_bucket(
        &mut self,
        partition: &[u8],
        owned: impl Fn(u32) -> bool,
        max_count: u64,
    ) -> u32 {
        let buckets = self.stats.entry(partition.to_vec()).or_default();
        for (&bucket, count) in buckets.iter_mut() {
            if owned(bucket) && *count < max_count {
                *count += 1;
                return bucket;
            }
        }
        let mut bucket = 0;
        loop {
            if owned(bucket) && !buckets.contains_key(&bucket) {
                buckets.insert(bucket, 1);
                return bucket;
            }
            bucket += 1;
        }
    }

    pub fn decrement(&mut self, partition: &[u8], bucket: u32) {
        if let Some(buckets) = self.stats.get_mut(partition) {
            if let Some(count) = buckets.get_mut(&bucket) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

/// Routes records of a cross-partition primary-key table: assigns the
/// effective (partition, bucket), maintaining the key index and emitting
/// retractions when a key migrates.
pub struct GlobalIndexAssigner {
    schema: TableSchema,
    kv: IndexKv,
    part_mapping: IdMapping,
    bucket_assigner: BucketAssigner,
    exists_action: ExistsAction,
    num_assigners: u32,
    assign_id: u32,
    target_bucket_row_number: u64,
    bootstrap: Option<BinaryExternalSortBuffer>,
}

/// A routed record: the effective partition payload and bucket to write to.
#[derive(Debug, PartialEq)]
pub struct RoutedRecord {
    pub record: CdcRecord,
    pub partition: Vec<u8>,
    pub bucket: u32,
}

impl GlobalIndexAssigner {
    pub fn open(
        tmp_dir: impl AsRef<Path>,
        schema: TableSchema,
        options: &CoreOptions,
        num_assigners: u32,
        assign_id: u32,
    ) -> Result<Self> {
        if assign_id >= num_assigners.max(1) {
            return Err(Error::InvalidInput(format!(
                "assigner id {assign_id} out of range for {num_assigners} assigners"
            )));
        }
        let tmp_dir = tmp_dir.as_ref();
        let kv = IndexKv::open(
            tmp_dir.join(format!("keyindex-{assign_id}")),
            options.cross_partition_index_ttl,
        )?;
        let pool = MemoryPool::new((options.write_buffer_size / 2).max(64 * 1024));
        let bootstrap = BinaryExternalSortBuffer::new(
            tmp_dir,
            &format!("bootstrap-{assign_id}"),
            pool,
            options.local_sort_max_num_file_handles,
        );

        Ok(Self {
            exists_action: ExistsAction::from_merge_engine(options.merge_engine),
            schema,
            kv,
            part_mapping: IdMapping::default(),
            bucket_assigner: BucketAssigner::default(),
            num_assigners: num_assigners.max(1),
            assign_id,
            target_bucket_row_number: options.dynamic_bucket_target_row_num,
            bootstrap: Some(bootstrap),
        })
    }

    /// Feeds one existing table row during bootstrap, before live input.
    pub fn bootstrap_record(&mut self, record: &CdcRecord, bucket: u32) -> Result<()> {
        let Some(buffer) = self.bootstrap.as_mut() else {
            return errdata!("bootstrap record after bootstrap ended");
        };
        let partition = self.schema.extract_partition(&record.row);
        let key = self.schema.extract_key(&record.row);
        let part_id = self.part_mapping.index(&partition);
        self.bucket_assigner.bootstrap_bucket(&partition, bucket);

        let value = encode_location(part_id, bucket);
        if !buffer.write(&key, &value)? {
            buffer.spill()?;
            if !buffer.write(&key, &value)? {
                return Err(Error::BufferFull);
            }
        }
        Ok(())
    }

    /// Sorts and bulk-loads the bootstrap set. Keys seen twice keep the
    /// latest location when the partition agrees; disagreeing duplicates are
    /// a broken table and fail loudly.
    pub fn end_bootstrap(&mut self) -> Result<()> {
        let Some(mut buffer) = self.bootstrap.take() else {
            return errdata!("bootstrap already ended");
        };
        let mut loaded = 0usize;
        let mut current: Option<(Vec<u8>, Vec<u8>)> = None;
        let mut deduped: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();

        for record in buffer.sorted_iter()? {
            let (key, _, value) = record?;
            let same_key = current.as_ref().is_some_and(|(k, _)| *k == key);
            if same_key {
                if let Some((_, current_value)) = current.as_mut() {
                    let (previous_part, _) = decode_location(current_value)?;
                    let (incoming_part, _) = decode_location(&value)?;
                    if previous_part != incoming_part {
                        return Err(Error::DuplicateKey(format!(
                            "bootstrap found key in partitions {previous_part} and \
                             {incoming_part} with no resolution policy"
                        )));
                    }
                    // Same partition: the later row wins.
                    *current_value = value;
                }
            } else if let Some(finished) = current.replace((key, value)) {
                deduped.push(finished);
            }
        }
        if let Some(finished) = current {
            deduped.push(finished);
        }
        loaded += deduped.len();
        self.kv.bulk_load(deduped.into_iter())?;
        tracing::info!(
            assign_id = self.assign_id,
            keys = loaded,
            "Loaded global index bootstrap"
        );
        Ok(())
    }

    /// Routes one live record. Emitted records (the input, possibly
    /// rewritten, plus any retraction) go to the collector in order.
    pub fn process(
        &mut self,
        record: CdcRecord,
        collect: &mut impl FnMut(RoutedRecord),
    ) -> Result<()> {
        if self.bootstrap.is_some() {
            return errdata!("process called before end_bootstrap");
        }
        let partition = self.schema.extract_partition(&record.row);
        let key = self.schema.extract_key(&record.row);
        let part_id = self.part_mapping.index(&partition);

        let Some(existing) = self.kv.get(&key) else {
            return self.place_new(record, partition, part_id, key, collect);
        };
        let (previous_part_id, previous_bucket) = decode_location(&existing)?;
        if previous_part_id == part_id {
            collect(RoutedRecord {
                record,
                partition,
                bucket: previous_bucket,
            });
            return Ok(());
        }

        match self.exists_action {
            ExistsAction::Delete => {
                let previous_part = self
                    .part_mapping
                    .get(previous_part_id)
                    .ok_or_else(|| {
                        Error::InvalidData(format!(
                            "unknown partition id {previous_part_id} in index"
                        ))
                    })?
                    .to_vec();
                let mut retract_row = record.row.clone();
                self.schema.rewrite_partition(&mut retract_row, &previous_part)?;
                collect(RoutedRecord {
                    record: CdcRecord::new(RowKind::Delete, retract_row),
                    partition: previous_part.clone(),
                    bucket: previous_bucket,
                });
                self.bucket_assigner.decrement(&previous_part, previous_bucket);

                self.place_new(record, partition, part_id, key, collect)
            }
            ExistsAction::UseOld => {
                let previous_part = self
                    .part_mapping
                    .get(previous_part_id)
                    .ok_or_else(|| {
                        Error::InvalidData(format!(
                            "unknown partition id {previous_part_id} in index"
                        ))
                    })?
                    .to_vec();
                let mut rewritten = record;
                self.schema
                    .rewrite_partition(&mut rewritten.row, &previous_part)?;
                collect(RoutedRecord {
                    record: rewritten,
                    partition: previous_part,
                    bucket: previous_bucket,
                });
                Ok(())
            }
            ExistsAction::SkipNew => Ok(()),
        }
    }

    fn place_new(
        &mut self,
        record: CdcRecord,
        partition: Vec<u8>,
        part_id: u32,
        key: Vec<u8>,
        collect: &mut impl FnMut(RoutedRecord),
    ) -> Result<()> {
        let bucket = self.assign_bucket(&partition);
        self.kv.put(key, encode_location(part_id, bucket))?;
        collect(RoutedRecord {
            record,
            partition,
            bucket,
        });
        Ok(())
    }

    fn assign_bucket(&mut self, partition: &[u8]) -> u32 {
        let num_assigners = self.num_assigners;
        let assign_id = self.assign_id;
        self.bucket_assigner.assign_bucket(
            partition,
            |bucket| bucket % num_assigners == assign_id,
            self.target_bucket_row_number,
        )
    }

    pub fn sync(&self) -> Result<()> {
        self.kv.sync()
    }
}

fn encode_location(part_id: u32, bucket: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    write_varint(&mut buf, u64::from(part_id));
    write_varint(&mut buf, u64::from(bucket));
    buf
}

fn decode_location(buf: &[u8]) -> Result<(u32, u32)> {
    let mut pos = 0;
    let part_id = read_varint(buf, &mut pos)?;
    let bucket = read_varint(buf, &mut pos)?;
    Ok((part_id as u32, bucket as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Datum;
    use crate::schema::DataType;
    use crate::tmpfs::TempDir;
    use std::collections::BTreeMap as OptionMap;

    fn schema() -> Result<TableSchema> {
        TableSchema::new(
            vec![
                ("id", DataType::Int),
                ("pt", DataType::String),
                ("v", DataType::Int),
            ],
            vec!["pt"],
            vec!["id"],
            OptionMap::new(),
        )
    }

    fn record(id: i64, pt: &str, v: i64) -> CdcRecord {
        CdcRecord::insert(vec![
            Some(Datum::Int(id)),
            Some(Datum::String(pt.to_string())),
            Some(Datum::Int(v)),
        ])
    }

    fn assigner(dir: &TempDir, options: &CoreOptions) -> Result<GlobalIndexAssigner> {
        GlobalIndexAssigner::open(dir.path(), schema()?, options, 1, 0)
    }

    fn route(
        assigner: &mut GlobalIndexAssigner,
        record: CdcRecord,
    ) -> Result<Vec<RoutedRecord>> {
        let mut routed = Vec::new();
        assigner.process(record, &mut |r| routed.push(r))?;
        Ok(routed)
    }

    #[test]
    fn test_dynamic_bucket_assignment_sequence() -> Result<()> {
        // Keys 1..=7 with target-row-num 3, one shard, one partition:
        // buckets [0, 0, 0, 1, 1, 1, 2].
        let dir = TempDir::new()?;
        let options = CoreOptions::default()
            .with_bucket(-1)
            .with_dynamic_bucket_target_row_num(3);
        let mut assigner = assigner(&dir, &options)?;
        assigner.end_bootstrap()?;

        let mut buckets = Vec::new();
        for id in 1..=7 {
            for routed in route(&mut assigner, record(id, "A", id))? {
                buckets.push(routed.bucket);
            }
        }
        assert_eq!(buckets, vec![0, 0, 0, 1, 1, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_same_partition_keeps_bucket() -> Result<()> {
        let dir = TempDir::new()?;
        let options = CoreOptions::default().with_bucket(-1);
        let mut assigner = assigner(&dir, &options)?;
        assigner.end_bootstrap()?;

        let first = route(&mut assigner, record(7, "A", 1))?;
        let second = route(&mut assigner, record(7, "A", 2))?;
        assert_eq!(first[0].bucket, second[0].bucket);
        assert_eq!(second.len(), 1);
        Ok(())
    }

    #[test]
    fn test_cross_partition_deduplicate_emits_retraction() -> Result<()> {
        let dir = TempDir::new()?;
        let options = CoreOptions::default().with_bucket(-1);
        let mut assigner = assigner(&dir, &options)?;
        assigner.end_bootstrap()?;

        route(&mut assigner, record(7, "A", 10))?;
        let routed = route(&mut assigner, record(7, "B", 20))?;

        assert_eq!(routed.len(), 2);
        // First the retraction targeting the old partition.
        assert_eq!(routed[0].record.kind, RowKind::Delete);
        assert_eq!(routed[0].record.row[1], Some(Datum::String("A".into())));
        // Then the insert at the new location.
        assert_eq!(routed[1].record.kind, RowKind::Insert);
        assert_eq!(routed[1].record.row[1], Some(Datum::String("B".into())));
        Ok(())
    }

    #[test]
    fn test_cross_partition_use_old_rewrites_partition() -> Result<()> {
        let dir = TempDir::new()?;
        let options = CoreOptions::default()
            .with_bucket(-1)
            .with_merge_engine(MergeEngine::PartialUpdate);
        let mut assigner = assigner(&dir, &options)?;
        assigner.end_bootstrap()?;

        let first = route(&mut assigner, record(7, "A", 10))?;
        let routed = route(&mut assigner, record(7, "B", 20))?;

        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].record.kind, RowKind::Insert);
        assert_eq!(routed[0].record.row[1], Some(Datum::String("A".into())));
        assert_eq!(routed[0].record.row[2], Some(Datum::Int(20)));
        assert_eq!(routed[0].bucket, first[0].bucket);
        Ok(())
    }

    #[test]
    fn test_cross_partition_skip_new_drops_record() -> Result<()> {
        let dir = TempDir::new()?;
        let options = CoreOptions::default()
            .with_bucket(-1)
            .with_merge_engine(MergeEngine::FirstRow);
        let mut assigner = assigner(&dir, &options)?;
        assigner.end_bootstrap()?;

        route(&mut assigner, record(7, "A", 10))?;
        let routed = route(&mut assigner, record(7, "B", 20))?;
        assert!(routed.is_empty());
        Ok(())
    }

    #[test]
    fn test_bootstrap_dedup_and_conflict() -> Result<()> {
        let dir = TempDir::new()?;
        let options = CoreOptions::default().with_bucket(-1);

        // Same key twice in the same partition: the later row wins quietly.
        let mut assigner = assigner(&dir, &options)?;
        assigner.bootstrap_record(&record(1, "A", 1), 0)?;
        assigner.bootstrap_record(&record(1, "A", 2), 3)?;
        assigner.end_bootstrap()?;
        let routed = route(&mut assigner, record(1, "A", 5))?;
        assert_eq!(routed[0].bucket, 3);

        // Same key in two partitions: fail loudly.
        let dir2 = TempDir::new()?;
        let mut conflicted = GlobalIndexAssigner::open(dir2.path(), schema()?, &options, 1, 0)?;
        conflicted.bootstrap_record(&record(1, "A", 1), 0)?;
        conflicted.bootstrap_record(&record(1, "B", 1), 0)?;
        assert!(matches!(
            conflicted.end_bootstrap(),
            Err(Error::DuplicateKey(_))
        ));
        Ok(())
    }

    #[test]
    fn test_shard_owns_disjoint_buckets() -> Result<()> {
        let dir = TempDir::new()?;
        let options = CoreOptions::default()
            .with_bucket(-1)
            .with_dynamic_bucket_target_row_num(1);

        let mut shard0 = GlobalIndexAssigner::open(dir.path(), schema()?, &options, 2, 0)?;
        shard0.end_bootstrap()?;
        let mut shard1 =
            GlobalIndexAssigner::open(dir.path().join("s1"), schema()?, &options, 2, 1)?;
        shard1.end_bootstrap()?;

        let mut buckets0 = Vec::new();
        let mut buckets1 = Vec::new();
        for id in 0..4 {
            buckets0.extend(route(&mut shard0, record(id, "A", id))?.iter().map(|r| r.bucket));
            buckets1.extend(
                route(&mut shard1, record(id + 100, "A", id))?
                    .iter()
                    .map(|r| r.bucket),
            );
        }
        assert!(buckets0.iter().all(|b| b % 2 == 0));
        assert!(buckets1.iter().all(|b| b % 2 == 1));
        Ok(())
    }
}
