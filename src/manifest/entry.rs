//! Manifest entries: ADD/DELETE records for data file membership.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::file::DataFileMeta;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Add,
    Delete,
}

/// One ADD or DELETE of a data file in a (partition, bucket).
///
/// `total_buckets` records the bucket count in force when the file was
/// written; the scan planner uses it to detect stale layouts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub kind: FileKind,
    pub partition: Vec<u8>,
    pub bucket: u32,
    pub total_buckets: u32,
    pub file: DataFileMeta,
}

/// Identity of a file within the table, used for ADD/DELETE balancing.
pub type EntryIdentifier = (Vec<u8>, u32, String);

impl ManifestEntry {
    pub fn add(partition: Vec<u8>, bucket: u32, total_buckets: u32, file: DataFileMeta) -> Self {
        Self {
            kind: FileKind::Add,
            partition,
            bucket,
            total_buckets,
            file,
        }
    }

    pub fn delete(partition: Vec<u8>, bucket: u32, total_buckets: u32, file: DataFileMeta) -> Self {
        Self {
            kind: FileKind::Delete,
            partition,
            bucket,
            total_buckets,
            file,
        }
    }

    pub fn identifier(&self) -> EntryIdentifier {
        (
            self.partition.clone(),
            self.bucket,
            self.file.file_name.clone(),
        )
    }
}

/// Folds a stream of entries, in manifest order, down to the live file set:
/// a file appears in the output iff its ADD/DELETE balance is positive.
///
/// A DELETE whose ADD lives in an earlier, unread manifest (a delta-only
/// scan over a compaction snapshot) simply cancels nothing here.
pub fn merge_entries(
    entries: impl IntoIterator<Item = ManifestEntry>,
) -> Result<Vec<ManifestEntry>> {
    let mut live: BTreeMap<EntryIdentifier, ManifestEntry> = BTreeMap::new();
    for entry in entries {
        match entry.kind {
            FileKind::Add => {
                if live.insert(entry.identifier(), entry).is_some() {
                    return Err(Error::CorruptManifest(
                        "data file added twice".to_string(),
                    ));
                }
            }
            FileKind::Delete => {
                live.remove(&entry.identifier());
            }
        }
    }
    Ok(live.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn test_merge_add_then_delete() -> Result<()> {
        let entries = vec![
            ManifestEntry::add(vec![], 0, 1, file("a")),
            ManifestEntry::add(vec![], 0, 1, file("b")),
            ManifestEntry::delete(vec![], 0, 1, file("a")),
        ];
        let live = merge_entries(entries)?;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].file.file_name, "b");
        Ok(())
    }

    #[test]
    fn test_same_name_different_bucket_is_distinct() -> Result<()> {
        let entries = vec![
            ManifestEntry::add(vec![], 0, 2, file("a")),
            ManifestEntry::add(vec![], 1, 2, file("a")),
            ManifestEntry::delete(vec![], 1, 2, file("a")),
        ];
        let live = merge_entries(entries)?;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].bucket, 0);
        Ok(())
    }

    #[test]
    fn test_delete_of_unread_add_cancels_nothing() -> Result<()> {
        // A delta-only scan can observe a DELETE whose ADD sits in the base.
        let entries = vec![
            ManifestEntry::delete(vec![], 0, 1, file("a")),
            ManifestEntry::add(vec![], 0, 1, file("b")),
        ];
        let live = merge_entries(entries)?;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].file.file_name, "b");
        Ok(())
    }

    #[test]
    fn test_double_add_is_corrupt() {
        let entries = vec![
            ManifestEntry::add(vec![], 0, 1, file("a")),
            ManifestEntry::add(vec![], 0, 1, file("a")),
        ];
        assert!(matches!(
            merge_entries(entries),
            Err(Error::CorruptManifest(_))
        ));
    }
}
