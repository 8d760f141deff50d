//! Table-level façade: write, commit, read.
//!
//! `FileStoreTable` binds a directory, a schema and the parsed options.
//! `TableWrite` routes CDC records to per-(partition, bucket) merge-tree
//! writers — through the static bucket hash, or through the global index
//! assigner in dynamic bucket mode — and hands file deltas to `TableCommit`.
//! `read_all` replays the live files through the configured merge engine,
//! which is also what the index bootstrap feeds on.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use itertools::Itertools;

use crate::commit::{CommitMessage, FileStoreCommit, ManifestCommittable};
use crate::config::CoreOptions;
use crate::data::{CdcRecord, KeyValue, Row};
#[cfg(test)]
use crate::data::RowKind;
use crate::encoding::keycode;
use crate::error::{Error, Result};
use crate::file::{DataFileMeta, DataFilePathFactory, KeyValueFileReader};
use crate::hasher;
use crate::index::GlobalIndexAssigner;
use crate::manifest::{ManifestFile, ManifestList};
use crate::memory::MemoryPool;
use crate::mergetree::{KeyValueIter, LoserTree, MergeFunction, MergeTreeWriter};
use crate::predicate::Predicate;
use crate::scan::{FileStoreScan, Plan, ScanKind};
use crate::schema::{SchemaManager, TableSchema};
use crate::snapshot::SnapshotManager;

/// Total bucket count recorded on manifest entries of dynamic-bucket tables.
const DYNAMIC_BUCKETS: u32 = 0;

#[derive(Clone)]
pub struct FileStoreTable {
    table_dir: PathBuf,
    schema: TableSchema,
    options: CoreOptions,
}

impl FileStoreTable {
    /// Creates a new table at `dir`, persisting the schema descriptor.
    pub fn create(dir: impl AsRef<Path>, schema: TableSchema) -> Result<Self> {
        let options = CoreOptions::from_map(&schema.options, true)?;
        std::fs::create_dir_all(dir.as_ref())?;
        SchemaManager::new(dir.as_ref()).commit(&schema)?;
        Ok(Self {
            table_dir: dir.as_ref().to_path_buf(),
            schema,
            options,
        })
    }

    /// Opens an existing table from its latest schema.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let schema = SchemaManager::new(dir.as_ref())
            .latest()?
            .ok_or_else(|| Error::InvalidInput("table has no schema".to_string()))?;
        let options = CoreOptions::from_map(&schema.options, false)?;
        Ok(Self {
            table_dir: dir.as_ref().to_path_buf(),
            schema,
            options,
        })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn options(&self) -> &CoreOptions {
        &self.options
    }

    pub fn snapshot_manager(&self) -> SnapshotManager {
        SnapshotManager::new(&self.table_dir)
    }

    fn total_buckets(&self) -> u32 {
        if self.options.dynamic_bucket() {
            DYNAMIC_BUCKETS
        } else {
            self.options.bucket as u32
        }
    }

    pub fn new_scan(&self) -> FileStoreScan {
        FileStoreScan::new(
            self.snapshot_manager(),
            ManifestFile::new(
                &self.table_dir,
                &self.schema,
                self.options.manifest_target_file_size,
            ),
            ManifestList::new(&self.table_dir),
            self.schema.clone(),
            self.total_buckets(),
            self.options.scan_manifest_parallelism,
        )
    }

    pub fn new_write(&self) -> Result<TableWrite> {
        TableWrite::new(self.clone())
    }

    pub fn new_commit(&self, commit_user: &str) -> TableCommit {
        TableCommit {
            commit: FileStoreCommit::new(
                &self.table_dir,
                self.schema.clone(),
                self.options.clone(),
                commit_user,
                self.total_buckets(),
            ),
        }
    }

    /// Truncates history back to `snapshot_id`; later snapshots are removed
    /// and the next commit renumbers from there.
    pub fn rollback_to(&self, snapshot_id: u64) -> Result<()> {
        self.snapshot_manager().rollback_to(snapshot_id)
    }

    /// Reads the merged state of the latest (or given) snapshot: every live
    /// file replayed per (partition, bucket) through the merge engine, with
    /// retractions dropped.
    pub fn read_all(&self, snapshot_id: Option<u64>) -> Result<Vec<Row>> {
        let mut scan = self.new_scan();
        if let Some(id) = snapshot_id {
            scan = scan.with_snapshot(id);
        }
        let plan = scan.plan()?;
        let mut rows = Vec::new();
        for (partition, bucket, files) in group_by_bucket(plan) {
            for kv in self.read_bucket(&partition, bucket, &files)? {
                rows.push(kv.value);
            }
        }
        Ok(rows)
    }

    /// Reads the changelog files attached to one snapshot, raw, with their
    /// original row kinds.
    pub fn read_changelog(&self, snapshot_id: u64) -> Result<Vec<KeyValue>> {
        let plan = self
            .new_scan()
            .with_kind(ScanKind::Changelog)
            .with_snapshot(snapshot_id)
            .plan()?;
        let mut records = Vec::new();
        for (partition, bucket, files) in group_by_bucket(plan) {
            let factory = self.path_factory(&partition, bucket)?;
            for file in files {
                for kv in KeyValueFileReader::open(factory.to_path(&file.file_name))? {
                    records.push(kv?);
                }
            }
        }
        Ok(records)
    }

    /// Merged live records of one bucket, in key order.
    fn read_bucket(
        &self,
        partition: &[u8],
        bucket: u32,
        files: &[DataFileMeta],
    ) -> Result<Vec<KeyValue>> {
        let factory = self.path_factory(partition, bucket)?;
        let inputs: Vec<KeyValueIter> = files
            .iter()
            .map(|file| {
                KeyValueFileReader::open(factory.to_path(&file.file_name))
                    .map(|reader| Box::new(reader) as KeyValueIter)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut tree = LoserTree::new(inputs)?;
        let mut merge = MergeFunction::create(&self.options, &self.schema)?;
        let mut records = Vec::new();
        loop {
            tree.adjust_for_next_loop();
            if tree.peek_winner().is_none() {
                break;
            }
            merge.reset();
            while let Some(kv) = tree.pop_winner()? {
                merge.add(kv)?;
            }
            if let Some(result) = merge.result()? {
                if !result.kind.is_retract() {
                    records.push(result);
                }
            }
        }
        Ok(records)
    }

    fn path_factory(&self, partition: &[u8], bucket: u32) -> Result<DataFilePathFactory> {
        let partition_path = self.schema.partition_path(partition)?;
        Ok(DataFilePathFactory::new(
            &self.table_dir,
            &partition_path,
            bucket,
        ))
    }
}

fn group_by_bucket(plan: Plan) -> Vec<(Vec<u8>, u32, Vec<DataFileMeta>)> {
    let mut groups: BTreeMap<(Vec<u8>, u32), Vec<DataFileMeta>> = BTreeMap::new();
    for entry in plan.files {
        groups
            .entry((entry.partition.clone(), entry.bucket))
            .or_default()
            .push(entry.file);
    }
    groups
        .into_iter()
        .map(|((partition, bucket), files)| (partition, bucket, files))
        .collect()
}

/// Routes records to per-bucket writers and produces commit messages.
pub struct TableWrite {
    table: FileStoreTable,
    pool: Arc<MemoryPool>,
    writers: HashMap<(Vec<u8>, u32), MergeTreeWriter>,
    assigner: Option<GlobalIndexAssigner>,
    bucket_key_indices: Vec<usize>,
    sequence_field_index: Option<usize>,
}

impl TableWrite {
    fn new(table: FileStoreTable) -> Result<Self> {
        let schema = &table.schema;
        let options = &table.options;
        if schema.primary_keys.is_empty() {
            return Err(Error::SchemaIncompatible(
                "the write path requires a primary key".to_string(),
            ));
        }

        let bucket_key_indices =
            schema.field_indices(&schema.bucket_keys(&options.bucket_key));
        let sequence_field_index = match &options.sequence_field {
            Some(field) => Some(schema.field_index(field).ok_or_else(|| {
                Error::InvalidInput(format!("sequence field {field:?} not found in schema"))
            })?),
            None => None,
        };

        // Dynamic bucket mode routes through the global index; the assigner
        // bootstraps from the table's current merged state.
        let assigner = if options.dynamic_bucket() {
            let mut assigner = GlobalIndexAssigner::open(
                table.table_dir.join("tmp"),
                schema.clone(),
                options,
                1,
                0,
            )?;
            let plan = table.new_scan().plan()?;
            for (partition, bucket, files) in group_by_bucket(plan) {
                for kv in table.read_bucket(&partition, bucket, &files)? {
                    assigner.bootstrap_record(&CdcRecord::insert(kv.value), bucket)?;
                }
            }
            assigner.end_bootstrap()?;
            Some(assigner)
        } else {
            None
        };

        Ok(Self {
            pool: MemoryPool::new(table.options.write_buffer_size),
            table,
            writers: HashMap::new(),
            assigner,
            bucket_key_indices,
            sequence_field_index,
        })
    }

    pub fn write(&mut self, record: CdcRecord) -> Result<()> {
        if let Some(assigner) = self.assigner.as_mut() {
            let mut routed = Vec::new();
            assigner.process(record, &mut |r| routed.push(r))?;
            for routed in routed {
                self.write_to(routed.partition, routed.bucket, routed.record)?;
            }
            return Ok(());
        }

        let partition = self.table.schema.extract_partition(&record.row);
        let bucket_key = keycode::encode_projected(&record.row, &self.bucket_key_indices);
        let bucket = hasher::bucket_of(
            hasher::bucket_hash(&bucket_key),
            self.table.total_buckets(),
        );
        self.write_to(partition, bucket, record)
    }

    fn write_to(&mut self, partition: Vec<u8>, bucket: u32, record: CdcRecord) -> Result<()> {
        let sequence = match self.sequence_field_index {
            Some(index) => {
                let datum = record.row[index].as_ref().ok_or_else(|| {
                    Error::InvalidInput("sequence field must not be null".to_string())
                })?;
                let value = datum.as_sequence()?;
                Some(u64::try_from(value).map_err(|_| {
                    Error::InvalidInput(format!("sequence value {value} is negative"))
                })?)
            }
            None => None,
        };

        let key = self.table.schema.extract_key(&record.row);
        if !self.writers.contains_key(&(partition.clone(), bucket)) {
            let writer = self.create_writer(&partition, bucket)?;
            self.writers.insert((partition.clone(), bucket), writer);
        }
        let writer = self
            .writers
            .get_mut(&(partition.clone(), bucket))
            .ok_or_else(|| Error::InvalidData("writer vanished".to_string()))?;
        writer.write(record.kind, key, record.row, sequence)
    }

    fn create_writer(&self, partition: &[u8], bucket: u32) -> Result<MergeTreeWriter> {
        let restore_files = self.restore_files(partition, bucket)?;
        MergeTreeWriter::new(
            self.table.path_factory(partition, bucket)?,
            self.table.options.clone(),
            self.table.schema.clone(),
            self.pool.clone(),
            restore_files,
        )
    }

    /// The bucket's live files in the latest snapshot; the writer restores
    /// its levels and sequence counter from them.
    fn restore_files(&self, partition: &[u8], bucket: u32) -> Result<Vec<DataFileMeta>> {
        let plan = self.table.new_scan().with_bucket(bucket).plan()?;
        Ok(plan
            .files
            .into_iter()
            .filter(|entry| entry.partition == partition && entry.bucket == bucket)
            .map(|entry| entry.file)
            .collect())
    }

    /// Flushes every writer and collects the per-bucket file deltas.
    pub fn prepare_commit(&mut self, wait_for_compaction: bool) -> Result<Vec<CommitMessage>> {
        let total_buckets = self.table.total_buckets();
        let mut messages = Vec::new();
        for ((partition, bucket), writer) in self
            .writers
            .iter_mut()
            .sorted_by(|a, b| a.0.cmp(b.0))
        {
            let increment = writer.prepare_commit(wait_for_compaction)?;
            if increment.is_empty() {
                continue;
            }
            messages.push(CommitMessage {
                partition: partition.clone(),
                bucket: *bucket,
                total_buckets,
                increment,
            });
        }
        if let Some(assigner) = &self.assigner {
            assigner.sync()?;
        }
        Ok(messages)
    }

    /// Drops buffered state and stops background work.
    pub fn close(&mut self) -> Result<()> {
        for writer in self.writers.values_mut() {
            writer.close()?;
        }
        self.writers.clear();
        Ok(())
    }
}

/// Commits prepared messages as snapshots.
pub struct TableCommit {
    commit: FileStoreCommit,
}

impl TableCommit {
    /// Returns the ids of the snapshots this commit produced (empty when
    /// there was nothing to commit).
    pub fn commit(&self, identifier: u64, messages: Vec<CommitMessage>) -> Result<Vec<u64>> {
        self.commit.commit(ManifestCommittable {
            identifier,
            messages,
        })
    }

    /// Replaces the matched partitions with the prepared messages.
    pub fn overwrite(
        &self,
        filter: Option<Predicate>,
        identifier: u64,
        messages: Vec<CommitMessage>,
    ) -> Result<u64> {
        self.commit.overwrite(
            filter,
            ManifestCommittable {
                identifier,
                messages,
            },
        )
    }
}
