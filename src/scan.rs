//! Manifest-driven scan planning.
//!
//! Resolves, for one snapshot, the set of live data files a reader or
//! compactor must consume. Filters push down in stages: manifest files are
//! pruned by aggregated partition statistics before they are opened, rows
//! are filtered while each manifest is decoded, and the merged entries pass
//! the bucket / level / value-statistics filters.
//!
//! All configuration happens through the `with_*` builders before `plan()`;
//! the filter methods take `&self` and mutate nothing, because retained
//! manifests are read on a bounded pool of worker threads.

use crate::error::{Error, Result};
use crate::manifest::{
    merge_entries, FileKind, ManifestEntry, ManifestFile, ManifestFileMeta, ManifestList,
};
use crate::predicate::{BucketSelector, Predicate};
use crate::schema::TableSchema;
use crate::snapshot::{CommitKind, Snapshot, SnapshotManager, VERSION_WITHOUT_CHANGELOG};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanKind {
    /// Live files of the snapshot: base plus delta.
    All,
    /// Files added or deleted by the snapshot itself.
    Delta,
    /// Changelog files attached to the snapshot.
    Changelog,
}

/// A planned scan: the snapshot it resolved and the surviving entries.
#[derive(Debug)]
pub struct Plan {
    pub snapshot_id: Option<u64>,
    pub files: Vec<ManifestEntry>,
}

pub type LevelFilter = Box<dyn Fn(usize) -> bool + Send + Sync>;

pub struct FileStoreScan {
    snapshot_manager: SnapshotManager,
    manifest_file: ManifestFile,
    manifest_list: ManifestList,
    schema: TableSchema,
    num_buckets: u32,
    check_num_buckets: bool,
    parallelism: usize,

    partition_filter: Option<Predicate>,
    specified_bucket: Option<u32>,
    bucket_selector: Option<BucketSelector>,
    level_filter: Option<LevelFilter>,
    value_filter: Option<Predicate>,
    specified_snapshot: Option<u64>,
    specified_manifests: Option<Vec<ManifestFileMeta>>,
    kind: ScanKind,
}

impl FileStoreScan {
    pub fn new(
        snapshot_manager: SnapshotManager,
        manifest_file: ManifestFile,
        manifest_list: ManifestList,
        schema: TableSchema,
        num_buckets: u32,
        parallelism: usize,
    ) -> Self {
        Self {
            snapshot_manager,
            manifest_file,
            manifest_list,
            schema,
            num_buckets,
            check_num_buckets: true,
            parallelism: parallelism.max(1),
            partition_filter: None,
            specified_bucket: None,
            bucket_selector: None,
            level_filter: None,
            value_filter: None,
            specified_snapshot: None,
            specified_manifests: None,
            kind: ScanKind::All,
        }
    }

    /// Predicate over the partition columns (field indices are positions in
    /// the partition tuple).
    pub fn with_partition_filter(mut self, predicate: Predicate) -> Self {
        self.partition_filter = Some(predicate);
        self
    }

    pub fn with_bucket(mut self, bucket: u32) -> Self {
        self.specified_bucket = Some(bucket);
        self
    }

    /// Narrows buckets from equality predicates over the bucket key columns.
    /// `configured_bucket_key` is the table's `bucket-key` option; empty
    /// falls back to the trimmed primary key.
    pub fn with_bucket_key_filter(
        mut self,
        predicate: &Predicate,
        configured_bucket_key: &[String],
    ) -> Self {
        let bucket_key_fields = self
            .schema
            .field_indices(&self.schema.bucket_keys(configured_bucket_key));
        self.bucket_selector = BucketSelector::create(predicate, &bucket_key_fields);
        self
    }

    pub fn with_level_filter(mut self, filter: LevelFilter) -> Self {
        self.level_filter = Some(filter);
        self
    }

    /// Predicate over the value columns, applied to file statistics.
    pub fn with_value_filter(mut self, predicate: Predicate) -> Self {
        self.value_filter = Some(predicate);
        self
    }

    pub fn with_snapshot(mut self, snapshot_id: u64) -> Self {
        debug_assert!(
            self.specified_manifests.is_none(),
            "cannot set both snapshot id and manifests"
        );
        self.specified_snapshot = Some(snapshot_id);
        self
    }

    pub fn with_manifest_list(mut self, manifests: Vec<ManifestFileMeta>) -> Self {
        debug_assert!(
            self.specified_snapshot.is_none(),
            "cannot set both snapshot id and manifests"
        );
        self.specified_manifests = Some(manifests);
        self
    }

    pub fn with_kind(mut self, kind: ScanKind) -> Self {
        self.kind = kind;
        self
    }

    /// Disables the bucket-count check; used by the overwrite path that
    /// rescales the layout.
    pub fn with_bucket_check_disabled(mut self) -> Self {
        self.check_num_buckets = false;
        self
    }

    pub fn plan(&self) -> Result<Plan> {
        let (snapshot_id, manifests) = self.resolve_manifests()?;

        let retained: Vec<&ManifestFileMeta> = manifests
            .iter()
            .filter(|meta| match self.filter_manifest_meta(meta) {
                Ok(keep) => keep,
                Err(_) => true,
            })
            .collect();
        tracing::debug!(
            total = manifests.len(),
            retained = retained.len(),
            "Planning scan over manifest files"
        );

        let entries = self.read_manifests_parallel(&retained)?;
        let merged = merge_entries(entries)?;

        let mut files = Vec::new();
        for entry in merged {
            if self.check_num_buckets && entry.total_buckets != self.num_buckets {
                return Err(Error::BucketCountMismatch {
                    expected: self.num_buckets,
                    actual: entry.total_buckets,
                });
            }
            if self.filter_by_bucket(&entry)
                && self.filter_by_bucket_selector(&entry)
                && self.filter_by_level(&entry)
                && self.filter_by_stats(&entry)?
            {
                files.push(entry);
            }
        }
        Ok(Plan { snapshot_id, files })
    }

    fn resolve_manifests(&self) -> Result<(Option<u64>, Vec<ManifestFileMeta>)> {
        if let Some(manifests) = &self.specified_manifests {
            return Ok((None, manifests.clone()));
        }
        let snapshot_id = match self.specified_snapshot {
            Some(id) => Some(id),
            None => self.snapshot_manager.latest_snapshot_id()?,
        };
        let Some(snapshot_id) = snapshot_id else {
            return Ok((None, Vec::new()));
        };
        let snapshot = self.snapshot_manager.snapshot(snapshot_id)?;
        let manifests = self.manifests_of(&snapshot)?;
        Ok((Some(snapshot_id), manifests))
    }

    fn manifests_of(&self, snapshot: &Snapshot) -> Result<Vec<ManifestFileMeta>> {
        match self.kind {
            ScanKind::All => {
                let mut manifests = self.manifest_list.read(&snapshot.base_manifest_list)?;
                manifests.extend(self.manifest_list.read(&snapshot.delta_manifest_list)?);
                Ok(manifests)
            }
            ScanKind::Delta => self.manifest_list.read(&snapshot.delta_manifest_list),
            ScanKind::Changelog => {
                if snapshot.version > VERSION_WITHOUT_CHANGELOG {
                    return match &snapshot.changelog_manifest_list {
                        Some(list) => self.manifest_list.read(list),
                        None => Ok(Vec::new()),
                    };
                }
                // Pre-changelog snapshots: APPEND deltas double as changelog.
                if snapshot.commit_kind == CommitKind::Append {
                    return self.manifest_list.read(&snapshot.delta_manifest_list);
                }
                Err(Error::InvalidInput(format!(
                    "changelog scan does not accept {:?} snapshot {}",
                    snapshot.commit_kind, snapshot.id
                )))
            }
        }
    }

    fn read_manifests_parallel(
        &self,
        manifests: &[&ManifestFileMeta],
    ) -> Result<Vec<ManifestEntry>> {
        if manifests.is_empty() {
            return Ok(Vec::new());
        }
        let chunk_size = manifests.len().div_ceil(self.parallelism);
        let chunks: Vec<&[&ManifestFileMeta]> = manifests.chunks(chunk_size).collect();

        let results: Vec<Result<Vec<ManifestEntry>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = chunks
                .into_iter()
                .map(|chunk| {
                    scope.spawn(move || {
                        let mut entries = Vec::new();
                        for meta in chunk {
                            entries.extend(self.read_one_manifest(meta)?);
                        }
                        Ok(entries)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(_) => Err(Error::Io("manifest reader thread panicked".to_string())),
                })
                .collect()
        });

        // Entry order across chunks follows manifest order; required for
        // correct ADD/DELETE balancing.
        let mut entries = Vec::new();
        for result in results {
            entries.extend(result?);
        }
        Ok(entries)
    }

    /// Note: runs on the parallel reader threads; must stay pure.
    fn read_one_manifest(&self, meta: &ManifestFileMeta) -> Result<Vec<ManifestEntry>> {
        let filter = |entry: &ManifestEntry| -> bool {
            if let Some(predicate) = &self.partition_filter {
                let matched = self
                    .schema
                    .decode_partition(&entry.partition)
                    .and_then(|row| predicate.test_row(&row));
                if !matched.unwrap_or(true) {
                    return false;
                }
            }
            // The bucket pushdown only applies when the entry was written
            // under the current bucket count; older layouts must surface so
            // the planner can report the mismatch.
            if let Some(bucket) = self.specified_bucket {
                if entry.total_buckets == self.num_buckets && entry.bucket != bucket {
                    return false;
                }
            }
            true
        };
        self.manifest_file.read(&meta.file_name, Some(&filter))
    }

    /// Note: keep thread-safe; called before manifests are dispatched.
    fn filter_manifest_meta(&self, meta: &ManifestFileMeta) -> Result<bool> {
        let Some(predicate) = &self.partition_filter else {
            return Ok(true);
        };
        predicate.test_stats(
            &meta.partition_stats,
            meta.num_added_files + meta.num_deleted_files,
        )
    }

    /// Note: keep thread-safe.
    fn filter_by_bucket(&self, entry: &ManifestEntry) -> bool {
        self.specified_bucket
            .map_or(true, |bucket| entry.bucket == bucket)
    }

    /// Note: keep thread-safe.
    fn filter_by_bucket_selector(&self, entry: &ManifestEntry) -> bool {
        self.bucket_selector
            .as_ref()
            .map_or(true, |selector| selector.select(entry.bucket, entry.total_buckets))
    }

    /// Note: keep thread-safe.
    fn filter_by_level(&self, entry: &ManifestEntry) -> bool {
        self.level_filter
            .as_ref()
            .map_or(true, |filter| filter(entry.file.level))
    }

    /// Note: keep thread-safe.
    fn filter_by_stats(&self, entry: &ManifestEntry) -> Result<bool> {
        let Some(predicate) = &self.value_filter else {
            return Ok(true);
        };
        debug_assert_eq!(entry.kind, FileKind::Add);
        predicate.test_stats(&entry.file.value_stats, entry.file.row_count)
    }
}
