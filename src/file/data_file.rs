//! Data file reader/writer and metadata.
//!
//! A data file holds a sorted sequence of `(key, sequence, kind, value)`
//! records for one (partition, bucket). Files are immutable once finished;
//! the writer goes through a temp-free single pass because an unfinished
//! file is simply never referenced by a manifest.
//!
//! ## File layout
//!
//! ```text
//! +--------------------+
//! | magic "DLKV"       |
//! | version: u8        |
//! | schema id: u64     |
//! +--------------------+
//! | framed KeyValue 1  |
//! | framed KeyValue 2  |
//! | ...                |
//! +--------------------+
//! ```
//!
//! Every frame is length-prefixed and CRC32-checksummed (see
//! [`crate::encoding`]); corruption surfaces as [`Error::CorruptDataFile`].

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data::KeyValue;
use crate::encoding::{read_frame, write_frame};
use crate::error::{Error, Result};
use crate::file::stats::{FieldStats, StatsCollector};

const MAGIC: &[u8; 4] = b"DLKV";
const VERSION: u8 = 1;

/// Metadata describing one immutable data file, as recorded in manifests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataFileMeta {
    pub file_name: String,
    pub file_size: u64,
    pub row_count: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub key_stats: Vec<FieldStats>,
    pub value_stats: Vec<FieldStats>,
    pub min_sequence: u64,
    pub max_sequence: u64,
    pub schema_id: u64,
    pub level: usize,
    pub extra_files: Vec<String>,
    pub creation_time: u64,
}

/// Allocates file names and paths inside one (partition, bucket) directory.
///
/// Layout: `<table>/bucket-<b>/<partition-path>/data-<uuid>.dfl`.
#[derive(Clone, Debug)]
pub struct DataFilePathFactory {
    bucket_dir: PathBuf,
}

impl DataFilePathFactory {
    pub fn new(table_dir: impl AsRef<Path>, partition_path: &str, bucket: u32) -> Self {
        Self {
            bucket_dir: table_dir
                .as_ref()
                .join(format!("bucket-{bucket}"))
                .join(partition_path),
        }
    }

    pub fn bucket_dir(&self) -> &Path {
        &self.bucket_dir
    }

    pub fn new_data_file(&self) -> (String, PathBuf) {
        let name = format!("data-{}.dfl", Uuid::new_v4());
        let path = self.bucket_dir.join(&name);
        (name, path)
    }

    pub fn new_changelog_file(&self) -> (String, PathBuf) {
        let name = format!("changelog-{}.dfl", Uuid::new_v4());
        let path = self.bucket_dir.join(&name);
        (name, path)
    }

    pub fn to_path(&self, file_name: &str) -> PathBuf {
        self.bucket_dir.join(file_name)
    }
}

/// Streams records into one data file, collecting statistics on the way.
///
/// Records must arrive in ascending (key, sequence) order; the resulting
/// min/max key range relies on it.
pub struct KeyValueFileWriter {
    writer: BufWriter<File>,
    file_name: String,
    path: PathBuf,
    schema_id: u64,
    level: usize,
    key_indices: Vec<usize>,
    key_stats: StatsCollector,
    value_stats: StatsCollector,
    row_count: u64,
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,
    min_sequence: u64,
    max_sequence: u64,
    bytes_written: u64,
}

impl KeyValueFileWriter {
    pub fn create(
        file_name: String,
        path: PathBuf,
        schema_id: u64,
        arity: usize,
        key_indices: Vec<usize>,
        level: usize,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(&path)?);
        writer.write_all(MAGIC)?;
        writer.write_u8(VERSION)?;
        writer.write_u64::<BigEndian>(schema_id)?;

        Ok(Self {
            writer,
            file_name,
            path,
            schema_id,
            level,
            key_stats: StatsCollector::new(key_indices.len()),
            key_indices,
            value_stats: StatsCollector::new(arity),
            row_count: 0,
            min_key: None,
            max_key: None,
            min_sequence: u64::MAX,
            max_sequence: 0,
            bytes_written: 13,
        })
    }

    pub fn write(&mut self, kv: &KeyValue) -> Result<()> {
        let payload = bincode::serialize(kv)?;
        write_frame(&mut self.writer, &payload)?;
        self.bytes_written += payload.len() as u64 + 8;

        if self.min_key.is_none() {
            self.min_key = Some(kv.key.clone());
        }
        self.max_key = Some(kv.key.clone());
        self.min_sequence = self.min_sequence.min(kv.sequence);
        self.max_sequence = self.max_sequence.max(kv.sequence);
        self.row_count += 1;

        let key_fields: Vec<_> = self
            .key_indices
            .iter()
            .map(|&i| kv.value.get(i).cloned().flatten())
            .collect();
        self.key_stats.update(&key_fields)?;
        self.value_stats.update(&kv.value)?;
        Ok(())
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flushes, syncs and seals the file, returning its metadata.
    pub fn finish(mut self) -> Result<DataFileMeta> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        let file_size = std::fs::metadata(&self.path)?.len();

        Ok(DataFileMeta {
            file_name: self.file_name,
            file_size,
            row_count: self.row_count,
            min_key: self.min_key.unwrap_or_default(),
            max_key: self.max_key.unwrap_or_default(),
            key_stats: self.key_stats.finish(),
            value_stats: self.value_stats.finish(),
            min_sequence: if self.row_count == 0 {
                0
            } else {
                self.min_sequence
            },
            max_sequence: self.max_sequence,
            schema_id: self.schema_id,
            level: self.level,
            extra_files: Vec::new(),
            creation_time: unix_millis(),
        })
    }

    /// Abandons the file. Safe because nothing references it yet.
    pub fn abort(self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Iterates the records of one data file.
pub struct KeyValueFileReader {
    reader: BufReader<File>,
    file_name: String,
}

impl KeyValueFileReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("<unknown>")
            .to_string();
        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|e| Error::CorruptDataFile(format!("{file_name}: {e}")))?;
        if &magic != MAGIC {
            return Err(Error::CorruptDataFile(format!(
                "{file_name}: bad magic bytes"
            )));
        }
        let version = reader.read_u8()?;
        if version != VERSION {
            return Err(Error::CorruptDataFile(format!(
                "{file_name}: unsupported version {version}"
            )));
        }
        let _schema_id = reader.read_u64::<BigEndian>()?;

        Ok(Self { reader, file_name })
    }
}

impl Iterator for KeyValueFileReader {
    type Item = Result<KeyValue>;

    fn next(&mut self) -> Option<Self::Item> {
        match read_frame(&mut self.reader) {
            Ok(None) => None,
            Ok(Some(payload)) => Some(
                bincode::deserialize(&payload)
                    .map_err(|e| Error::CorruptDataFile(format!("{}: {e}", self.file_name))),
            ),
            Err(e) => Some(Err(Error::CorruptDataFile(format!(
                "{}: {e}",
                self.file_name
            )))),
        }
    }
}

/// Writes a record stream into one or more files, rolling at the target
/// size. All produced files share the same level.
pub struct RollingFileWriter {
    factory: DataFilePathFactory,
    schema_id: u64,
    arity: usize,
    key_indices: Vec<usize>,
    level: usize,
    target_file_size: u64,
    current: Option<KeyValueFileWriter>,
    finished: Vec<DataFileMeta>,
}

impl RollingFileWriter {
    pub fn new(
        factory: DataFilePathFactory,
        schema_id: u64,
        arity: usize,
        key_indices: Vec<usize>,
        level: usize,
        target_file_size: u64,
    ) -> Self {
        Self {
            factory,
            schema_id,
            arity,
            key_indices,
            level,
            target_file_size,
            current: None,
            finished: Vec::new(),
        }
    }

    pub fn write(&mut self, kv: &KeyValue) -> Result<()> {
        if self.current.is_none() {
            let (file_name, path) = self.factory.new_data_file();
            self.current = Some(KeyValueFileWriter::create(
                file_name,
                path,
                self.schema_id,
                self.arity,
                self.key_indices.clone(),
                self.level,
            )?);
        }
        let mut roll = false;
        if let Some(writer) = self.current.as_mut() {
            writer.write(kv)?;
            roll = writer.bytes_written() >= self.target_file_size;
        }
        if roll {
            if let Some(full) = self.current.take() {
                self.finished.push(full.finish()?);
            }
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<Vec<DataFileMeta>> {
        if let Some(writer) = self.current.take() {
            if writer.row_count() > 0 {
                self.finished.push(writer.finish()?);
            } else {
                writer.abort();
            }
        }
        Ok(self.finished)
    }

    pub fn abort(mut self) {
        if let Some(writer) = self.current.take() {
            writer.abort();
        }
        for meta in &self.finished {
            let _ = std::fs::remove_file(self.factory.to_path(&meta.file_name));
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Datum, RowKind};
    use crate::tmpfs::TempDir;

    fn kv(key: u64, seq: u64, value: i64) -> KeyValue {
        KeyValue::new(
            key.to_be_bytes().to_vec(),
            seq,
            RowKind::Insert,
            vec![Some(Datum::Int(key as i64)), Some(Datum::Int(value))],
        )
    }

    #[test]
    fn test_write_read_round_trip() -> Result<()> {
        let dir = TempDir::new()?;
        let factory = DataFilePathFactory::new(dir.path(), "", 0);
        let (file_name, path) = factory.new_data_file();

        let mut writer =
            KeyValueFileWriter::create(file_name.clone(), path.clone(), 0, 2, vec![0], 0)?;
        let records: Vec<KeyValue> = (0..100).map(|i| kv(i, i + 1000, i as i64 * 2)).collect();
        for record in &records {
            writer.write(record)?;
        }
        let meta = writer.finish()?;

        assert_eq!(meta.row_count, 100);
        assert_eq!(meta.min_key, 0u64.to_be_bytes().to_vec());
        assert_eq!(meta.max_key, 99u64.to_be_bytes().to_vec());
        assert_eq!(meta.min_sequence, 1000);
        assert_eq!(meta.max_sequence, 1099);
        assert_eq!(meta.value_stats[1].min, Some(Datum::Int(0)));
        assert_eq!(meta.value_stats[1].max, Some(Datum::Int(198)));
        assert_eq!(meta.key_stats[0].min, Some(Datum::Int(0)));

        let read: Vec<KeyValue> =
            KeyValueFileReader::open(&path)?.collect::<Result<Vec<_>>>()?;
        assert_eq!(read, records);
        Ok(())
    }

    #[test]
    fn test_corrupt_file_detected() -> Result<()> {
        let dir = TempDir::new()?;
        let factory = DataFilePathFactory::new(dir.path(), "", 0);
        let (file_name, path) = factory.new_data_file();

        let mut writer = KeyValueFileWriter::create(file_name, path.clone(), 0, 2, vec![0], 0)?;
        writer.write(&kv(1, 1, 1))?;
        writer.finish()?;

        // Flip a payload byte past the header.
        let mut bytes = std::fs::read(&path)?;
        let target = bytes.len() - 6;
        bytes[target] ^= 0xff;
        std::fs::write(&path, bytes)?;

        let mut reader = KeyValueFileReader::open(&path)?;
        assert!(matches!(
            reader.next(),
            Some(Err(Error::CorruptDataFile(_)))
        ));
        Ok(())
    }

    #[test]
    fn test_rolling_writer_splits_at_target_size() -> Result<()> {
        let dir = TempDir::new()?;
        let factory = DataFilePathFactory::new(dir.path(), "pt=A/", 3);
        let mut writer = RollingFileWriter::new(factory.clone(), 0, 2, vec![0], 1, 256);

        for i in 0..200u64 {
            writer.write(&kv(i, i, i as i64))?;
        }
        let files = writer.finish()?;
        assert!(files.len() > 1);
        assert!(files.iter().all(|f| f.level == 1));

        let mut total = 0;
        for meta in &files {
            let read: Vec<KeyValue> = KeyValueFileReader::open(factory.to_path(&meta.file_name))?
                .collect::<Result<Vec<_>>>()?;
            assert_eq!(read.len() as u64, meta.row_count);
            total += read.len();
        }
        assert_eq!(total, 200);
        Ok(())
    }
}
