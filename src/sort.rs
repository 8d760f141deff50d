//! Two-stage external sorter.
//!
//! Records are appended to an in-memory buffer whose entries carry an 8-byte
//! normalized key prefix, so most comparisons never touch the full key. When
//! the memory budget is exhausted the buffer is sorted and spilled to disk as
//! a run; when the number of spilled runs reaches the configured file-handle
//! limit, intermediate merges fold them into larger runs. The final output is
//! a single merge over the surviving runs plus any remaining in-memory data.
//!
//! Used by the write buffer of the merge-tree writer and by the global index
//! bootstrap.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::encoding::{read_frame, write_frame};
use crate::error::Result;
use crate::memory::MemoryPool;

/// Fixed per-entry accounting overhead on top of key and payload bytes.
const ENTRY_OVERHEAD: usize = 48;

#[derive(Debug)]
struct Entry {
    prefix: u64,
    key: Vec<u8>,
    stamp: u64,
    payload: Vec<u8>,
}

impl Entry {
    fn new(key: Vec<u8>, stamp: u64, payload: Vec<u8>) -> Self {
        Self {
            prefix: normalized_prefix(&key),
            key,
            stamp,
            payload,
        }
    }

    fn cmp_order(&self, other: &Self) -> Ordering {
        self.prefix
            .cmp(&other.prefix)
            .then_with(|| self.key.cmp(&other.key))
            .then_with(|| self.stamp.cmp(&other.stamp))
    }
}

/// Big-endian u64 over the first 8 key bytes, zero-padded.
fn normalized_prefix(key: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    let len = key.len().min(8);
    raw[..len].copy_from_slice(&key[..len]);
    u64::from_be_bytes(raw)
}

/// A sorted record produced by the merge: `(key, stamp, payload)`.
pub type SortedRecord = (Vec<u8>, u64, Vec<u8>);

pub struct BinaryExternalSortBuffer {
    pool: Arc<MemoryPool>,
    reserved: usize,
    entries: Vec<Entry>,
    record_count: usize,
    spill_dir: PathBuf,
    spill_prefix: String,
    spills: Vec<PathBuf>,
    next_spill_id: usize,
    max_file_handles: usize,
    next_stamp: u64,
}

impl BinaryExternalSortBuffer {
    pub fn new(
        spill_dir: impl AsRef<Path>,
        spill_prefix: &str,
        pool: Arc<MemoryPool>,
        max_file_handles: usize,
    ) -> Self {
        Self {
            pool,
            reserved: 0,
            entries: Vec::new(),
            record_count: 0,
            spill_dir: spill_dir.as_ref().to_path_buf(),
            spill_prefix: spill_prefix.to_string(),
            spills: Vec::new(),
            next_spill_id: 0,
            max_file_handles: max_file_handles.max(2),
            next_stamp: 0,
        }
    }

    /// Appends a record. Returns false without consuming the record when the
    /// memory budget is exhausted; the caller decides between [`spill`] and
    /// draining via [`sorted_iter`].
    ///
    /// [`spill`]: Self::spill
    /// [`sorted_iter`]: Self::sorted_iter
    pub fn write(&mut self, key: &[u8], payload: &[u8]) -> Result<bool> {
        let cost = key.len() + payload.len() + ENTRY_OVERHEAD;
        if !self.pool.try_reserve(cost) {
            return Ok(false);
        }
        self.reserved += cost;
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.entries
            .push(Entry::new(key.to_vec(), stamp, payload.to_vec()));
        self.record_count += 1;
        Ok(true)
    }

    /// Total record count across memory and spilled runs.
    pub fn len(&self) -> usize {
        self.record_count
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    pub fn memory_bytes(&self) -> usize {
        self.reserved
    }

    /// Sorts the in-memory entries and writes them out as one spill run,
    /// releasing their memory. Triggers an intermediate merge when the run
    /// count reaches the file-handle limit.
    pub fn spill(&mut self) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        self.entries.sort_unstable_by(Entry::cmp_order);

        let path = self.next_spill_path();
        let mut writer = BufWriter::new(File::create(&path)?);
        for entry in self.entries.drain(..) {
            let payload = bincode::serialize(&(entry.stamp, &entry.key, &entry.payload))?;
            write_frame(&mut writer, &payload)?;
        }
        writer.flush()?;
        self.spills.push(path);

        self.pool.release(self.reserved);
        self.reserved = 0;

        if self.spills.len() >= self.max_file_handles {
            self.merge_spills()?;
        }
        Ok(())
    }

    /// Merges all current spill runs into a single larger run.
    fn merge_spills(&mut self) -> Result<()> {
        let sources = std::mem::take(&mut self.spills);
        let readers = sources
            .iter()
            .map(SpillReader::open)
            .collect::<Result<Vec<_>>>()?;

        let path = self.next_spill_path();
        let mut writer = BufWriter::new(File::create(&path)?);
        let mut merge = MergeIter::new(readers, Vec::new());
        while let Some(record) = merge.next() {
            let (key, stamp, payload) = record?;
            let frame = bincode::serialize(&(stamp, &key, &payload))?;
            write_frame(&mut writer, &frame)?;
        }
        writer.flush()?;
        self.spills.push(path);

        for source in sources {
            let _ = fs::remove_file(source);
        }
        Ok(())
    }

    /// Drains the buffer into a single sorted iterator over `(key, stamp,
    /// payload)`, ordered by key then insertion stamp. The buffer is empty
    /// and reusable afterwards.
    pub fn sorted_iter(&mut self) -> Result<SortedIter> {
        self.entries.sort_unstable_by(Entry::cmp_order);
        let entries = std::mem::take(&mut self.entries);
        let spills = std::mem::take(&mut self.spills);
        self.pool.release(self.reserved);
        self.reserved = 0;
        self.record_count = 0;

        let readers = spills
            .iter()
            .map(SpillReader::open)
            .collect::<Result<Vec<_>>>()?;
        Ok(SortedIter {
            merge: MergeIter::new(readers, entries),
            spills,
        })
    }

    /// Discards all buffered and spilled data.
    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.pool.release(self.reserved);
        self.reserved = 0;
        self.record_count = 0;
        for spill in self.spills.drain(..) {
            let _ = fs::remove_file(spill);
        }
        Ok(())
    }

    fn next_spill_path(&mut self) -> PathBuf {
        let id = self.next_spill_id;
        self.next_spill_id += 1;
        self.spill_dir
            .join(format!("{}-spill-{id}", self.spill_prefix))
    }
}

impl Drop for BinaryExternalSortBuffer {
    fn drop(&mut self) {
        let _ = self.clear();
    }
}

struct SpillReader {
    reader: BufReader<File>,
}

impl SpillReader {
    fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
        })
    }

    fn next(&mut self) -> Result<Option<SortedRecord>> {
        match read_frame(&mut self.reader)? {
            None => Ok(None),
            Some(payload) => {
                let (stamp, key, value): (u64, Vec<u8>, Vec<u8>) =
                    bincode::deserialize(&payload)?;
                Ok(Some((key, stamp, value)))
            }
        }
    }
}

struct HeapEntry {
    key: Vec<u8>,
    stamp: u64,
    payload: Vec<u8>,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.stamp == other.stamp
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap behavior.
        self.key
            .cmp(&other.key)
            .then_with(|| self.stamp.cmp(&other.stamp))
            .then_with(|| self.source.cmp(&other.source))
            .reverse()
    }
}

/// K-way merge over spill readers plus the remaining in-memory entries.
struct MergeIter {
    readers: Vec<SpillReader>,
    heap: BinaryHeap<HeapEntry>,
    in_memory: std::vec::IntoIter<Entry>,
    failed: bool,
}

impl MergeIter {
    fn new(mut readers: Vec<SpillReader>, entries: Vec<Entry>) -> Self {
        let mut heap = BinaryHeap::new();
        let mut failed = false;
        for (source, reader) in readers.iter_mut().enumerate() {
            match reader.next() {
                Ok(Some((key, stamp, payload))) => heap.push(HeapEntry {
                    key,
                    stamp,
                    payload,
                    source,
                }),
                Ok(None) => {}
                Err(_) => failed = true,
            }
        }
        let mut merge = Self {
            readers,
            heap,
            in_memory: entries.into_iter(),
            failed,
        };
        merge.prime_in_memory();
        merge
    }

    /// The in-memory run participates as one more source, identified by
    /// `usize::MAX`.
    fn prime_in_memory(&mut self) {
        if let Some(entry) = self.in_memory.next() {
            self.heap.push(HeapEntry {
                key: entry.key,
                stamp: entry.stamp,
                payload: entry.payload,
                source: usize::MAX,
            });
        }
    }

    fn next(&mut self) -> Option<Result<SortedRecord>> {
        if self.failed {
            self.failed = false;
            return Some(Err(crate::error::Error::InvalidData(
                "spill run read failed".to_string(),
            )));
        }
        let entry = self.heap.pop()?;
        if entry.source == usize::MAX {
            self.prime_in_memory();
        } else {
            match self.readers[entry.source].next() {
                Ok(Some((key, stamp, payload))) => self.heap.push(HeapEntry {
                    key,
                    stamp,
                    payload,
                    source: entry.source,
                }),
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }
        }
        Some(Ok((entry.key, entry.stamp, entry.payload)))
    }
}

/// Sorted drain of a [`BinaryExternalSortBuffer`]; removes its spill files on
/// drop.
pub struct SortedIter {
    merge: MergeIter,
    spills: Vec<PathBuf>,
}

impl Iterator for SortedIter {
    type Item = Result<SortedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.merge.next()
    }
}

impl Drop for SortedIter {
    fn drop(&mut self) {
        for spill in &self.spills {
            let _ = fs::remove_file(spill);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn drain(buffer: &mut BinaryExternalSortBuffer) -> Result<Vec<SortedRecord>> {
        buffer.sorted_iter()?.collect()
    }

    #[test]
    fn test_in_memory_sort() -> Result<()> {
        let dir = TempDir::new()?;
        let pool = MemoryPool::new(1024 * 1024);
        let mut buffer = BinaryExternalSortBuffer::new(dir.path(), "t", pool, 8);

        for key in [5u64, 1, 9, 3, 7] {
            assert!(buffer.write(&key.to_be_bytes(), b"v")?);
        }
        let records = drain(&mut buffer)?;
        let keys: Vec<u64> = records
            .iter()
            .map(|(k, _, _)| u64::from_be_bytes(k[..8].try_into().unwrap()))
            .collect();
        assert_eq!(keys, vec![1, 3, 5, 7, 9]);
        assert!(buffer.is_empty());
        Ok(())
    }

    #[test]
    fn test_duplicate_keys_keep_insertion_order() -> Result<()> {
        let dir = TempDir::new()?;
        let pool = MemoryPool::new(1024 * 1024);
        let mut buffer = BinaryExternalSortBuffer::new(dir.path(), "t", pool, 8);

        buffer.write(b"k", b"first")?;
        buffer.write(b"k", b"second")?;
        buffer.write(b"k", b"third")?;
        let records = drain(&mut buffer)?;
        let payloads: Vec<&[u8]> = records.iter().map(|(_, _, p)| p.as_slice()).collect();
        assert_eq!(payloads, vec![b"first".as_slice(), b"second", b"third"]);
        Ok(())
    }

    #[test]
    fn test_spill_and_merge() -> Result<()> {
        let dir = TempDir::new()?;
        let pool = MemoryPool::new(1024 * 1024);
        let mut buffer = BinaryExternalSortBuffer::new(dir.path(), "t", pool, 3);

        let mut expected = Vec::new();
        for round in 0..5u64 {
            for key in 0..100u64 {
                let scrambled = (key * 37 + round * 11) % 500;
                buffer.write(&scrambled.to_be_bytes(), &round.to_be_bytes())?;
                expected.push(scrambled);
            }
            buffer.spill()?;
        }
        // Intermediate merges must have kept the run count below the limit.
        assert!(buffer.spills.len() < 3);

        expected.sort_unstable();
        let records = drain(&mut buffer)?;
        let keys: Vec<u64> = records
            .iter()
            .map(|(k, _, _)| u64::from_be_bytes(k[..8].try_into().unwrap()))
            .collect();
        assert_eq!(keys, expected);
        Ok(())
    }

    #[test]
    fn test_memory_exhaustion_reports_full() -> Result<()> {
        let dir = TempDir::new()?;
        let pool = MemoryPool::new(200);
        let mut buffer = BinaryExternalSortBuffer::new(dir.path(), "t", pool, 8);

        assert!(buffer.write(b"a", &[0u8; 32])?);
        assert!(!buffer.write(b"b", &[0u8; 200])?);
        buffer.spill()?;
        assert!(buffer.write(b"b", &[0u8; 100])?);
        Ok(())
    }
}
