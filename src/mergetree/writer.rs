//! The per-(partition, bucket) writer.
//!
//! Records buffer in a sort buffer keyed by (key, sequence). A full buffer
//! either spills inside the sorter (`write-buffer-spillable`) or flushes a
//! level-0 file inline. Flushes feed the universal compaction policy: at the
//! compaction trigger a background rewrite is scheduled, at the stop trigger
//! the writer stalls until the run count drops.
//!
//! The writer owns no background state directly; it exchanges requests and
//! results with its [`CompactExecutor`] and reintegrates finished rewrites
//! before reporting a commit increment.

use std::sync::Arc;

use crate::config::{ChangelogProducer, CoreOptions};
use crate::data::{KeyValue, Row, RowKind};
use crate::error::{Error, Result};
use crate::file::{DataFileMeta, DataFilePathFactory, KeyValueFileWriter};
use crate::memory::MemoryPool;
use crate::mergetree::compact::{
    pick_compaction, CompactExecutor, CompactRequest, CompactResult, CompactRewriter,
};
use crate::mergetree::levels::Levels;
use crate::schema::TableSchema;
use crate::sort::BinaryExternalSortBuffer;

/// Manifest-ready file deltas produced by one `prepare_commit`.
#[derive(Debug, Default)]
pub struct CommitIncrement {
    pub new_files: Vec<DataFileMeta>,
    pub changelog_files: Vec<DataFileMeta>,
    pub compact_before: Vec<DataFileMeta>,
    pub compact_after: Vec<DataFileMeta>,
    pub compact_changelog: Vec<DataFileMeta>,
}

impl CommitIncrement {
    pub fn is_empty(&self) -> bool {
        self.new_files.is_empty()
            && self.changelog_files.is_empty()
            && self.compact_before.is_empty()
            && self.compact_after.is_empty()
            && self.compact_changelog.is_empty()
    }
}

pub struct MergeTreeWriter {
    factory: DataFilePathFactory,
    options: CoreOptions,
    schema: TableSchema,
    key_indices: Vec<usize>,

    buffer: BinaryExternalSortBuffer,
    /// Raw inputs since the last flush, kept in arrival order for the
    /// `input` changelog producer.
    input_log: Vec<KeyValue>,
    next_sequence: u64,

    levels: Levels,
    executor: CompactExecutor,
    compaction_pending: bool,

    new_files: Vec<DataFileMeta>,
    changelog_files: Vec<DataFileMeta>,
    compact_before: Vec<DataFileMeta>,
    compact_after: Vec<DataFileMeta>,
    compact_changelog: Vec<DataFileMeta>,
}

impl MergeTreeWriter {
    /// Opens a writer over the bucket's currently live files.
    pub fn new(
        factory: DataFilePathFactory,
        options: CoreOptions,
        schema: TableSchema,
        pool: Arc<MemoryPool>,
        restore_files: Vec<DataFileMeta>,
    ) -> Result<Self> {
        std::fs::create_dir_all(factory.bucket_dir())?;
        let next_sequence = restore_files
            .iter()
            .map(|f| f.max_sequence + 1)
            .max()
            .unwrap_or(0);
        let levels = Levels::new(restore_files, options.num_levels);
        let key_indices = schema.field_indices(&schema.trimmed_primary_keys());

        if options.changelog_producer == ChangelogProducer::Lookup {
            return Err(Error::InvalidInput(
                "changelog-producer lookup is not supported".to_string(),
            ));
        }

        let rewriter = CompactRewriter::new(
            factory.clone(),
            options.clone(),
            schema.clone(),
            key_indices.clone(),
        );
        let buffer = BinaryExternalSortBuffer::new(
            factory.bucket_dir(),
            "wb",
            pool,
            options.local_sort_max_num_file_handles,
        );

        Ok(Self {
            executor: CompactExecutor::start(rewriter),
            factory,
            key_indices,
            buffer,
            input_log: Vec::new(),
            next_sequence,
            levels,
            compaction_pending: false,
            new_files: Vec::new(),
            changelog_files: Vec::new(),
            compact_before: Vec::new(),
            compact_after: Vec::new(),
            compact_changelog: Vec::new(),
            options,
            schema,
        })
    }

    /// Enqueues one record. `sequence` overrides the writer's own counter
    /// when the table extracts sequence numbers from a column.
    pub fn write(
        &mut self,
        kind: RowKind,
        key: Vec<u8>,
        value: Row,
        sequence: Option<u64>,
    ) -> Result<()> {
        let sequence = match sequence {
            Some(sequence) => {
                self.next_sequence = self.next_sequence.max(sequence + 1);
                sequence
            }
            None => {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                sequence
            }
        };
        let kv = KeyValue::new(key, sequence, kind, value);

        if self.buffer_record(&kv)? {
            self.log_input(kv);
            return Ok(());
        }

        // Buffer full: spill inside the sorter or flush a level-0 file.
        if self.options.write_buffer_spillable {
            self.buffer.spill()?;
        } else {
            self.flush_memory()?;
        }
        if self.buffer_record(&kv)? {
            self.log_input(kv);
            return Ok(());
        }
        Err(Error::BufferFull)
    }

    fn buffer_record(&mut self, kv: &KeyValue) -> Result<bool> {
        let mut buffer_key = kv.key.clone();
        buffer_key.extend_from_slice(&kv.sequence.to_be_bytes());
        let payload = bincode::serialize(kv)?;
        self.buffer.write(&buffer_key, &payload)
    }

    fn log_input(&mut self, kv: KeyValue) {
        if self.options.changelog_producer == ChangelogProducer::Input {
            self.input_log.push(kv);
        }
    }

    /// Flushes buffered records as one level-0 file and reacts to the
    /// compaction thresholds.
    fn flush_memory(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            let (file_name, path) = self.factory.new_data_file();
            let mut writer = KeyValueFileWriter::create(
                file_name,
                path,
                self.schema.id,
                self.schema.fields.len(),
                self.key_indices.clone(),
                0,
            )?;
            for record in self.buffer.sorted_iter()? {
                let (_, _, payload) = record?;
                let kv: KeyValue = bincode::deserialize(&payload)?;
                writer.write(&kv)?;
            }
            let meta = writer.finish()?;
            tracing::info!(
                file = %meta.file_name,
                rows = meta.row_count,
                "Flushed level-0 file"
            );
            self.levels.add_level0_file(meta.clone());
            self.new_files.push(meta);

            if self.options.changelog_producer == ChangelogProducer::Input {
                self.write_input_changelog()?;
            }
        }

        self.absorb_compaction_results(false)?;

        // Write stall: block on the in-flight rewrite until the run count
        // drops below the stop trigger.
        while self.levels.num_sorted_runs() >= self.options.num_sorted_run_stop_trigger() {
            if !self.compaction_pending && !self.submit_compaction()? {
                break;
            }
            self.absorb_compaction_results(true)?;
        }

        if !self.compaction_pending
            && self.levels.num_sorted_runs() >= self.options.num_sorted_run_compaction_trigger
        {
            self.submit_compaction()?;
        }
        Ok(())
    }

    /// Writes the raw input records of the last flush interval as one
    /// changelog file, preserving arrival order and row kinds.
    fn write_input_changelog(&mut self) -> Result<()> {
        if self.input_log.is_empty() {
            return Ok(());
        }
        let (file_name, path) = self.factory.new_changelog_file();
        let mut writer = KeyValueFileWriter::create(
            file_name,
            path,
            self.schema.id,
            self.schema.fields.len(),
            self.key_indices.clone(),
            0,
        )?;
        for kv in self.input_log.drain(..) {
            writer.write(&kv)?;
        }
        self.changelog_files.push(writer.finish()?);
        Ok(())
    }

    fn submit_compaction(&mut self) -> Result<bool> {
        let Some(unit) = pick_compaction(
            &self.levels,
            self.options.num_sorted_run_compaction_trigger,
            self.options.compaction_size_ratio,
        ) else {
            return Ok(false);
        };
        let drop_delete = unit.output_level == self.levels.max_level();
        tracing::info!(
            inputs = unit.files.len(),
            output_level = unit.output_level,
            "Scheduling compaction"
        );
        self.executor.submit(CompactRequest { unit, drop_delete })?;
        self.compaction_pending = true;
        Ok(true)
    }

    /// Folds finished rewrites into the levels. A failed rewrite is logged
    /// and its inputs stay in place for the next cycle.
    fn absorb_compaction_results(&mut self, block: bool) -> Result<()> {
        loop {
            let fetched = if block && self.compaction_pending {
                Some(self.executor.fetch()?)
            } else {
                self.executor.try_fetch()?
            };
            let Some(outcome) = fetched else {
                return Ok(());
            };
            self.compaction_pending = false;
            match outcome {
                Ok(result) => self.apply_compaction(result),
                Err(e) => {
                    tracing::warn!(error = %e, "Compaction failed, inputs retained");
                }
            }
            if !block {
                continue;
            }
            return Ok(());
        }
    }

    fn apply_compaction(&mut self, result: CompactResult) {
        tracing::info!(
            before = result.before.len(),
            after = result.after.len(),
            "Compaction finished"
        );
        self.levels.update(&result.before, &result.after);
        self.compact_before.extend(result.before);
        self.compact_after.extend(result.after);
        self.compact_changelog.extend(result.changelog);
    }

    /// Flushes everything buffered and returns the accumulated file deltas.
    pub fn prepare_commit(&mut self, wait_for_compaction: bool) -> Result<CommitIncrement> {
        self.flush_memory()?;
        if wait_for_compaction {
            self.absorb_compaction_results(true)?;
        }
        self.absorb_compaction_results(false)?;

        Ok(CommitIncrement {
            new_files: std::mem::take(&mut self.new_files),
            changelog_files: std::mem::take(&mut self.changelog_files),
            compact_before: std::mem::take(&mut self.compact_before),
            compact_after: std::mem::take(&mut self.compact_after),
            compact_changelog: std::mem::take(&mut self.compact_changelog),
        })
    }

    /// Current sorted-run count; exposed for stall visibility.
    pub fn num_sorted_runs(&self) -> usize {
        self.levels.num_sorted_runs()
    }

    pub fn levels(&self) -> &Levels {
        &self.levels
    }

    /// Drops buffered state and cancels background work best-effort.
    /// Unflushed records are lost; uncommitted files stay orphaned until the
    /// expiration task collects them.
    pub fn close(&mut self) -> Result<()> {
        self.buffer.clear()?;
        self.input_log.clear();
        self.executor.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Datum;
    use crate::file::KeyValueFileReader;
    use crate::schema::DataType;
    use crate::tmpfs::TempDir;
    use std::collections::BTreeMap;

    fn schema() -> Result<TableSchema> {
        TableSchema::new(
            vec![("id", DataType::Int), ("v", DataType::Int)],
            vec![],
            vec!["id"],
            BTreeMap::new(),
        )
    }

    fn writer(dir: &TempDir, options: CoreOptions) -> Result<MergeTreeWriter> {
        let schema = schema()?;
        let factory = DataFilePathFactory::new(dir.path(), "", 0);
        let pool = MemoryPool::new(64 * 1024 * 1024);
        MergeTreeWriter::new(factory, options, schema, pool, Vec::new())
    }

    fn key(id: i64) -> Vec<u8> {
        crate::encoding::keycode::encode_fields([Some(&Datum::Int(id))])
    }

    fn row(id: i64, v: i64) -> Row {
        vec![Some(Datum::Int(id)), Some(Datum::Int(v))]
    }

    #[test]
    fn test_write_flush_produces_level0_file() -> Result<()> {
        let dir = TempDir::new()?;
        let mut w = writer(&dir, CoreOptions::default())?;

        for id in 0..10 {
            w.write(RowKind::Insert, key(id), row(id, id * 2), None)?;
        }
        let increment = w.prepare_commit(true)?;
        assert_eq!(increment.new_files.len(), 1);
        assert_eq!(increment.new_files[0].level, 0);
        assert_eq!(increment.new_files[0].row_count, 10);
        assert!(increment.compact_before.is_empty());
        w.close()?;
        Ok(())
    }

    #[test]
    fn test_empty_prepare_commit_is_empty() -> Result<()> {
        let dir = TempDir::new()?;
        let mut w = writer(&dir, CoreOptions::default())?;
        let increment = w.prepare_commit(true)?;
        assert!(increment.is_empty());
        w.close()?;
        Ok(())
    }

    #[test]
    fn test_sequence_numbers_are_monotonic_per_writer() -> Result<()> {
        let dir = TempDir::new()?;
        let mut w = writer(&dir, CoreOptions::default())?;
        w.write(RowKind::Insert, key(1), row(1, 1), None)?;
        w.write(RowKind::Insert, key(1), row(1, 2), None)?;
        let increment = w.prepare_commit(true)?;
        let meta = &increment.new_files[0];
        assert_eq!((meta.min_sequence, meta.max_sequence), (0, 1));
        w.close()?;
        Ok(())
    }

    #[test]
    fn test_compaction_bounds_sorted_runs() -> Result<()> {
        let dir = TempDir::new()?;
        let options = CoreOptions::default().with_compaction_trigger(3, 4);
        let mut w = writer(&dir, options)?;

        // Ten disjoint flushes; the stop trigger caps the run count at 4.
        for batch in 0..10 {
            for id in 0..5 {
                let id = batch * 5 + id;
                w.write(RowKind::Insert, key(id), row(id, batch), None)?;
            }
            let _ = w.prepare_commit(true)?;
            assert!(w.num_sorted_runs() <= 4, "runs = {}", w.num_sorted_runs());
        }

        // All fifty keys survive the merges.
        let files = w.levels().all_files();
        let mut keys = std::collections::BTreeSet::new();
        let factory = DataFilePathFactory::new(dir.path(), "", 0);
        for meta in files {
            for kv in KeyValueFileReader::open(factory.to_path(&meta.file_name))? {
                keys.insert(kv?.key);
            }
        }
        assert_eq!(keys.len(), 50);
        w.levels().check_run_invariants()?;
        w.close()?;
        Ok(())
    }

    #[test]
    fn test_buffer_full_flushes_inline() -> Result<()> {
        let dir = TempDir::new()?;
        let options = CoreOptions::default().with_write_buffer_size(4 * 1024);
        let schema = schema()?;
        let factory = DataFilePathFactory::new(dir.path(), "", 0);
        let pool = MemoryPool::new(4 * 1024);
        let mut w = MergeTreeWriter::new(factory, options, schema, pool, Vec::new())?;

        for id in 0..200 {
            w.write(RowKind::Insert, key(id), row(id, id), None)?;
        }
        let increment = w.prepare_commit(true)?;
        // Inline flushes happened before the final one.
        let total: u64 = increment.new_files.iter().map(|f| f.row_count).sum();
        let compacted: i64 = increment.compact_after.iter().map(|f| f.row_count as i64).sum::<i64>()
            - increment.compact_before.iter().map(|f| f.row_count as i64).sum::<i64>();
        assert_eq!(total as i64 + compacted, 200);
        w.close()?;
        Ok(())
    }

    #[test]
    fn test_input_changelog_written_per_flush() -> Result<()> {
        let dir = TempDir::new()?;
        let options =
            CoreOptions::default().with_changelog_producer(ChangelogProducer::Input);
        let mut w = writer(&dir, options)?;

        w.write(RowKind::Insert, key(1), row(1, 1), None)?;
        w.write(RowKind::Delete, key(1), row(1, 1), None)?;
        let increment = w.prepare_commit(true)?;
        assert_eq!(increment.changelog_files.len(), 1);

        let factory = DataFilePathFactory::new(dir.path(), "", 0);
        let records: Vec<KeyValue> =
            KeyValueFileReader::open(factory.to_path(&increment.changelog_files[0].file_name))?
                .collect::<Result<Vec<_>>>()?;
        // Arrival order with original kinds.
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, RowKind::Insert);
        assert_eq!(records[1].kind, RowKind::Delete);
        w.close()?;
        Ok(())
    }

    #[test]
    fn test_lookup_changelog_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let options =
            CoreOptions::default().with_changelog_producer(ChangelogProducer::Lookup);
        assert!(matches!(
            writer(&dir, options),
            Err(Error::InvalidInput(_))
        ));
        Ok(())
    }
}
