//! Manifest files: the immutable metadata tree under a snapshot.
//!
//! The manifest layer is a log of table-structure changes, playing the role
//! a version-edit log plays in a classic LSM store, except that every file is
//! immutable: a commit writes fresh manifest files and a fresh manifest list
//! instead of appending to a shared log.
//!
//! ```text
//! snapshot-<id> ── base manifest list ──┬── manifest-<uuid>  (entries)
//!                                       └── manifest-<uuid>
//!                  delta manifest list ──── manifest-<uuid>
//! ```
//!
//! Each manifest file carries framed [`ManifestEntry`] records plus header
//! magic; each frame is CRC32-checksummed, and corruption is reported as
//! [`Error::CorruptManifest`].

pub mod entry;
pub mod list;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{ReadBytesExt, WriteBytesExt};
use uuid::Uuid;

use crate::encoding::{read_frame, write_frame};
use crate::error::{Error, Result};
use crate::file::StatsCollector;
use crate::schema::TableSchema;

pub use entry::{merge_entries, EntryIdentifier, FileKind, ManifestEntry};
pub use list::{ManifestFileMeta, ManifestList};

pub const MANIFEST_DIR: &str = "manifest";

const MAGIC: &[u8; 4] = b"DLMF";
const VERSION: u8 = 1;

/// Reads and writes manifest files under `<table>/manifest/`.
#[derive(Clone, Debug)]
pub struct ManifestFile {
    manifest_dir: PathBuf,
    partition_arity: usize,
    schema_id: u64,
    target_file_size: u64,
}

impl ManifestFile {
    pub fn new(table_dir: impl AsRef<Path>, schema: &TableSchema, target_file_size: u64) -> Self {
        Self {
            manifest_dir: table_dir.as_ref().join(MANIFEST_DIR),
            partition_arity: schema.partition_keys.len(),
            schema_id: schema.id,
            target_file_size,
        }
    }

    /// Writes entries into one or more manifest files, rolling at the target
    /// size, and returns their metadata. Entry order is preserved.
    pub fn write(&self, entries: &[ManifestEntry]) -> Result<Vec<ManifestFileMeta>> {
        std::fs::create_dir_all(&self.manifest_dir)?;
        let mut metas = Vec::new();
        let mut writer: Option<SingleManifestWriter> = None;

        for entry in entries {
            if writer.is_none() {
                writer = Some(SingleManifestWriter::create(
                    &self.manifest_dir,
                    self.partition_arity,
                    self.schema_id,
                )?);
            }
            let mut finished = None;
            if let Some(current) = writer.as_mut() {
                current.write(entry)?;
                if current.bytes_written >= self.target_file_size {
                    finished = writer.take();
                }
            }
            if let Some(full) = finished {
                metas.push(full.finish()?);
            }
        }
        if let Some(last) = writer.take() {
            metas.push(last.finish()?);
        }
        Ok(metas)
    }

    /// Reads a manifest file, applying the row-level filter at decode time.
    /// The filter must be pure: it runs on the parallel scan readers.
    pub fn read(
        &self,
        file_name: &str,
        filter: Option<&(dyn Fn(&ManifestEntry) -> bool + Sync)>,
    ) -> Result<Vec<ManifestEntry>> {
        let path = self.manifest_dir.join(file_name);
        let corrupt = |detail: String| Error::CorruptManifest(format!("{file_name}: {detail}"));
        let mut reader = BufReader::new(File::open(&path)?);

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|e| corrupt(e.to_string()))?;
        if &magic != MAGIC {
            return Err(corrupt("bad magic bytes".to_string()));
        }
        let version = reader.read_u8()?;
        if version != VERSION {
            return Err(corrupt(format!("unsupported version {version}")));
        }

        let mut entries = Vec::new();
        while let Some(payload) = read_frame(&mut reader).map_err(|e| corrupt(e.to_string()))? {
            let entry: ManifestEntry =
                bincode::deserialize(&payload).map_err(|e| corrupt(e.to_string()))?;
            if filter.map_or(true, |f| f(&entry)) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub fn delete(&self, file_name: &str) -> Result<()> {
        std::fs::remove_file(self.manifest_dir.join(file_name))?;
        Ok(())
    }

    /// Merges an accumulated run of small manifest files into fewer, larger
    /// ones once their count reaches `merge_min_count`. Returns the original
    /// slice when no compaction applies.
    pub fn try_full_compaction(
        &self,
        manifests: Vec<ManifestFileMeta>,
        merge_min_count: usize,
    ) -> Result<Vec<ManifestFileMeta>> {
        if manifests.len() < merge_min_count {
            return Ok(manifests);
        }
        let mut all = Vec::new();
        for meta in &manifests {
            all.extend(self.read(&meta.file_name, None)?);
        }
        let live = merge_entries(all)?;
        let merged = self.write(&live)?;
        tracing::info!(
            before = manifests.len(),
            after = merged.len(),
            entries = live.len(),
            "Compacted manifest files"
        );
        Ok(merged)
    }
}

struct SingleManifestWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    file_name: String,
    bytes_written: u64,
    num_added: u64,
    num_deleted: u64,
    partition_stats: StatsCollector,
    partition_arity: usize,
    schema_id: u64,
}

impl SingleManifestWriter {
    fn create(manifest_dir: &Path, partition_arity: usize, schema_id: u64) -> Result<Self> {
        let file_name = format!("manifest-{}", Uuid::new_v4());
        let path = manifest_dir.join(&file_name);
        let mut writer = BufWriter::new(File::create(&path)?);
        writer.write_all(MAGIC)?;
        writer.write_u8(VERSION)?;
        Ok(Self {
            writer,
            path,
            file_name,
            bytes_written: 5,
            num_added: 0,
            num_deleted: 0,
            partition_stats: StatsCollector::new(partition_arity),
            partition_arity,
            schema_id,
        })
    }

    fn write(&mut self, entry: &ManifestEntry) -> Result<()> {
        let payload = bincode::serialize(entry)?;
        write_frame(&mut self.writer, &payload)?;
        self.bytes_written += payload.len() as u64 + 8;
        match entry.kind {
            FileKind::Add => self.num_added += 1,
            FileKind::Delete => self.num_deleted += 1,
        }
        let partition =
            crate::encoding::keycode::decode_fields(&entry.partition, self.partition_arity)?;
        self.partition_stats.update(&partition)?;
        Ok(())
    }

    fn finish(mut self) -> Result<ManifestFileMeta> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        let file_size = std::fs::metadata(&self.path)?.len();
        Ok(ManifestFileMeta {
            file_name: self.file_name,
            file_size,
            num_added_files: self.num_added,
            num_deleted_files: self.num_deleted,
            partition_stats: self.partition_stats.finish(),
            schema_id: self.schema_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Datum;
    use crate::encoding::keycode;
    use crate::file::DataFileMeta;
    use crate::schema::DataType;
    use crate::tmpfs::TempDir;
    use std::collections::BTreeMap;

    fn schema() -> Result<TableSchema> {
        TableSchema::new(
            vec![
                ("id", DataType::Int),
                ("pt", DataType::Int),
                ("v", DataType::Int),
            ],
            vec!["pt"],
            vec!["id"],
            BTreeMap::new(),
        )
    }

    fn file(name: &str) -> DataFileMeta {
        DataFileMeta {
            file_name: name.to_string(),
            file_size: 10,
            row_count: 1,
            min_key: vec![1],
            max_key: vec![9],
            key_stats: vec![],
            value_stats: vec![],
            min_sequence: 0,
            max_sequence: 0,
            schema_id: 0,
            level: 0,
            extra_files: vec![],
            creation_time: 0,
        }
    }

    fn partition(value: i64) -> Vec<u8> {
        keycode::encode_fields([Some(&Datum::Int(value))])
    }

    #[test]
    fn test_write_read_round_trip() -> Result<()> {
        let dir = TempDir::new()?;
        let schema = schema()?;
        let manifest = ManifestFile::new(dir.path(), &schema, 8 * 1024 * 1024);

        let entries = vec![
            ManifestEntry::add(partition(1), 0, 2, file("a")),
            ManifestEntry::add(partition(5), 1, 2, file("b")),
            ManifestEntry::delete(partition(1), 0, 2, file("c")),
        ];
        let metas = manifest.write(&entries)?;
        assert_eq!(metas.len(), 1);
        let meta = &metas[0];
        assert_eq!(meta.num_added_files, 2);
        assert_eq!(meta.num_deleted_files, 1);
        assert_eq!(meta.partition_stats[0].min, Some(Datum::Int(1)));
        assert_eq!(meta.partition_stats[0].max, Some(Datum::Int(5)));

        assert_eq!(manifest.read(&meta.file_name, None)?, entries);

        // Row-level filter applies at decode time.
        let bucket_zero =
            manifest.read(&meta.file_name, Some(&|entry: &ManifestEntry| entry.bucket == 0))?;
        assert_eq!(bucket_zero.len(), 2);
        Ok(())
    }

    #[test]
    fn test_rolling_by_target_size() -> Result<()> {
        let dir = TempDir::new()?;
        let schema = schema()?;
        let manifest = ManifestFile::new(dir.path(), &schema, 64);

        let entries: Vec<ManifestEntry> = (0..10)
            .map(|i| ManifestEntry::add(partition(i), 0, 1, file(&format!("f{i}"))))
            .collect();
        let metas = manifest.write(&entries)?;
        assert!(metas.len() > 1);

        let mut read_back = Vec::new();
        for meta in &metas {
            read_back.extend(manifest.read(&meta.file_name, None)?);
        }
        assert_eq!(read_back, entries);
        Ok(())
    }

    #[test]
    fn test_full_compaction_below_threshold_is_noop() -> Result<()> {
        let dir = TempDir::new()?;
        let schema = schema()?;
        let manifest = ManifestFile::new(dir.path(), &schema, 8 * 1024 * 1024);

        let metas = manifest.write(&[ManifestEntry::add(partition(1), 0, 1, file("a"))])?;
        let unchanged = manifest.try_full_compaction(metas.clone(), 10)?;
        assert_eq!(unchanged, metas);
        Ok(())
    }

    #[test]
    fn test_full_compaction_merges_entries() -> Result<()> {
        let dir = TempDir::new()?;
        let schema = schema()?;
        let manifest = ManifestFile::new(dir.path(), &schema, 8 * 1024 * 1024);

        let mut metas = Vec::new();
        metas.extend(manifest.write(&[ManifestEntry::add(partition(1), 0, 1, file("a"))])?);
        metas.extend(manifest.write(&[ManifestEntry::add(partition(1), 0, 1, file("b"))])?);
        metas.extend(manifest.write(&[ManifestEntry::delete(partition(1), 0, 1, file("a"))])?);

        let merged = manifest.try_full_compaction(metas, 3)?;
        assert_eq!(merged.len(), 1);
        let entries = manifest.read(&merged[0].file_name, None)?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file.file_name, "b");
        assert_eq!(entries[0].kind, FileKind::Add);
        Ok(())
    }
}
