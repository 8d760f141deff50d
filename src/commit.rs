//! Optimistic snapshot commits.
//!
//! A committer proposes snapshot `N+1` referencing freshly written manifest
//! files; exclusive creation of the `snapshot-<N+1>` descriptor is the
//! arbiter. On losing the race it re-reads the latest snapshot, re-validates
//! its deltas against the new base, and retries up to a bounded budget.
//! Manifest files written by a losing attempt are removed; data files are
//! never touched (an uncommitted data file is garbage, collected later).

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::CoreOptions;
use crate::error::{Error, Result};
use crate::manifest::{
    merge_entries, FileKind, ManifestEntry, ManifestFile, ManifestList,
};
use crate::mergetree::CommitIncrement;
use crate::predicate::Predicate;
use crate::scan::{FileStoreScan, ScanKind};
use crate::schema::TableSchema;
use crate::snapshot::{CommitKind, Snapshot, SnapshotManager, CURRENT_VERSION};

const COMMIT_RETRY_BUDGET: usize = 5;

/// File deltas of one (partition, bucket), as handed over by its writer.
#[derive(Debug)]
pub struct CommitMessage {
    pub partition: Vec<u8>,
    pub bucket: u32,
    pub total_buckets: u32,
    pub increment: CommitIncrement,
}

/// Everything one checkpoint wants committed atomically.
#[derive(Debug)]
pub struct ManifestCommittable {
    pub identifier: u64,
    pub messages: Vec<CommitMessage>,
}

/// Outcome of a single commit attempt.
#[derive(Debug)]
enum CommitAttempt {
    Committed(u64),
    Conflict,
}

pub struct FileStoreCommit {
    table_dir: PathBuf,
    schema: TableSchema,
    options: CoreOptions,
    snapshot_manager: SnapshotManager,
    manifest_file: ManifestFile,
    manifest_list: ManifestList,
    commit_user: String,
    num_buckets: u32,
}

impl FileStoreCommit {
    pub fn new(
        table_dir: impl AsRef<Path>,
        schema: TableSchema,
        options: CoreOptions,
        commit_user: &str,
        num_buckets: u32,
    ) -> Self {
        let table_dir = table_dir.as_ref().to_path_buf();
        Self {
            snapshot_manager: SnapshotManager::new(&table_dir),
            manifest_file: ManifestFile::new(
                &table_dir,
                &schema,
                options.manifest_target_file_size,
            ),
            manifest_list: ManifestList::new(&table_dir),
            commit_user: commit_user.to_string(),
            table_dir,
            schema,
            options,
            num_buckets,
        }
    }

    /// Commits the committable as up to two snapshots: an APPEND for new
    /// files and their changelog, then a COMPACT for compaction results.
    /// Returns the committed snapshot ids (empty for an empty committable).
    pub fn commit(&self, committable: ManifestCommittable) -> Result<Vec<u64>> {
        let mut append_entries = Vec::new();
        let mut append_changelog = Vec::new();
        let mut compact_entries = Vec::new();
        let mut compact_changelog = Vec::new();

        for message in &committable.messages {
            let entry = |kind: FileKind, file: &crate::file::DataFileMeta| ManifestEntry {
                kind,
                partition: message.partition.clone(),
                bucket: message.bucket,
                total_buckets: message.total_buckets,
                file: file.clone(),
            };
            let increment = &message.increment;
            for file in &increment.new_files {
                append_entries.push(entry(FileKind::Add, file));
            }
            for file in &increment.changelog_files {
                append_changelog.push(entry(FileKind::Add, file));
            }
            for file in &increment.compact_before {
                compact_entries.push(entry(FileKind::Delete, file));
            }
            for file in &increment.compact_after {
                compact_entries.push(entry(FileKind::Add, file));
            }
            for file in &increment.compact_changelog {
                compact_changelog.push(entry(FileKind::Add, file));
            }
        }

        let mut committed = Vec::new();
        if !append_entries.is_empty() || !append_changelog.is_empty() {
            committed.push(self.try_commit(
                CommitKind::Append,
                committable.identifier,
                append_entries,
                append_changelog,
                false,
            )?);
        }
        if !compact_entries.is_empty() || !compact_changelog.is_empty() {
            committed.push(self.try_commit(
                CommitKind::Compact,
                committable.identifier,
                compact_entries,
                compact_changelog,
                true,
            )?);
        }
        Ok(committed)
    }

    /// Replaces the live contents of the partitions matched by `filter`
    /// (every partition when `None`) with the committable's new files. The
    /// only path that may change the bucket count.
    pub fn overwrite(
        &self,
        filter: Option<Predicate>,
        committable: ManifestCommittable,
    ) -> Result<u64> {
        let mut attempt = 0;
        loop {
            // Deletions depend on the latest snapshot, so they are recomputed
            // on every attempt.
            let mut scan = self.new_scan().with_bucket_check_disabled();
            if let Some(filter) = filter.clone() {
                scan = scan.with_partition_filter(filter);
            }
            let plan = scan.plan()?;

            let mut entries: Vec<ManifestEntry> = plan
                .files
                .into_iter()
                .map(|mut entry| {
                    entry.kind = FileKind::Delete;
                    entry
                })
                .collect();
            for message in &committable.messages {
                for file in &message.increment.new_files {
                    entries.push(ManifestEntry {
                        kind: FileKind::Add,
                        partition: message.partition.clone(),
                        bucket: message.bucket,
                        total_buckets: message.total_buckets,
                        file: file.clone(),
                    });
                }
            }

            match self.attempt_commit(
                CommitKind::Overwrite,
                committable.identifier,
                &entries,
                &[],
                false,
            )? {
                CommitAttempt::Committed(id) => return Ok(id),
                CommitAttempt::Conflict => {
                    attempt += 1;
                    if attempt >= COMMIT_RETRY_BUDGET {
                        let latest = self.snapshot_manager.latest_snapshot_id()?.unwrap_or(0);
                        return Err(Error::CommitConflict { latest });
                    }
                }
            }
        }
    }

    fn try_commit(
        &self,
        kind: CommitKind,
        identifier: u64,
        entries: Vec<ManifestEntry>,
        changelog: Vec<ManifestEntry>,
        validate_deletes: bool,
    ) -> Result<u64> {
        let mut attempt = 0;
        loop {
            match self.attempt_commit(kind, identifier, &entries, &changelog, validate_deletes)? {
                CommitAttempt::Committed(id) => return Ok(id),
                CommitAttempt::Conflict => {
                    attempt += 1;
                    let latest = self.snapshot_manager.latest_snapshot_id()?.unwrap_or(0);
                    if attempt >= COMMIT_RETRY_BUDGET {
                        return Err(Error::CommitConflict { latest });
                    }
                    tracing::warn!(
                        attempt = attempt,
                        latest = latest,
                        "Commit conflict, rebasing and retrying"
                    );
                }
            }
        }
    }

    fn attempt_commit(
        &self,
        kind: CommitKind,
        identifier: u64,
        entries: &[ManifestEntry],
        changelog: &[ManifestEntry],
        validate_deletes: bool,
    ) -> Result<CommitAttempt> {
        let latest = self.snapshot_manager.latest_snapshot()?;
        let new_id = latest.as_ref().map_or(1, |snapshot| snapshot.id + 1);

        if validate_deletes {
            self.check_deletes_still_live(latest.as_ref(), entries)?;
        }

        // New base: the previous snapshot's full manifest set, compacted
        // when enough small manifest files have piled up.
        let base_metas = match &latest {
            Some(snapshot) => {
                let mut metas = self.manifest_list.read(&snapshot.base_manifest_list)?;
                metas.extend(self.manifest_list.read(&snapshot.delta_manifest_list)?);
                self.manifest_file
                    .try_full_compaction(metas, self.options.manifest_merge_min_count)?
            }
            None => Vec::new(),
        };

        let delta_metas = self.manifest_file.write(entries)?;
        let changelog_metas = self.manifest_file.write(changelog)?;

        let delta_record_count: i64 = entries
            .iter()
            .map(|entry| match entry.kind {
                FileKind::Add => entry.file.row_count as i64,
                FileKind::Delete => -(entry.file.row_count as i64),
            })
            .sum();
        let changelog_record_count: u64 =
            changelog.iter().map(|entry| entry.file.row_count).sum();
        let total_record_count = latest
            .as_ref()
            .map_or(0, |snapshot| snapshot.total_record_count)
            .saturating_add_signed(delta_record_count);

        let snapshot = Snapshot {
            version: CURRENT_VERSION,
            id: new_id,
            schema_id: self.schema.id,
            base_manifest_list: self.manifest_list.write(&base_metas)?,
            delta_manifest_list: self.manifest_list.write(&delta_metas)?,
            changelog_manifest_list: if changelog_metas.is_empty() {
                None
            } else {
                Some(self.manifest_list.write(&changelog_metas)?)
            },
            commit_user: self.commit_user.clone(),
            commit_identifier: identifier,
            commit_kind: kind,
            time_millis: unix_millis(),
            log_offsets: None,
            total_record_count,
            delta_record_count,
            changelog_record_count,
        };

        if self.snapshot_manager.try_commit(&snapshot)? {
            tracing::info!(
                snapshot = new_id,
                kind = ?kind,
                added = entries.iter().filter(|e| e.kind == FileKind::Add).count(),
                deleted = entries.iter().filter(|e| e.kind == FileKind::Delete).count(),
                "Committed snapshot"
            );
            return Ok(CommitAttempt::Committed(new_id));
        }

        // Lost the race: remove this attempt's manifest files before rebasing.
        for meta in delta_metas.iter().chain(&changelog_metas) {
            let _ = self.manifest_file.delete(&meta.file_name);
        }
        Ok(CommitAttempt::Conflict)
    }

    /// A COMPACT commit deletes files it read as inputs; if a concurrent
    /// commit already removed one of them the rewrite result is stale and
    /// must be abandoned, not retried.
    fn check_deletes_still_live(
        &self,
        latest: Option<&Snapshot>,
        entries: &[ManifestEntry],
    ) -> Result<()> {
        let deletes: Vec<&ManifestEntry> = entries
            .iter()
            .filter(|entry| entry.kind == FileKind::Delete)
            .collect();
        if deletes.is_empty() {
            return Ok(());
        }
        let Some(latest) = latest else {
            return Err(Error::CompactionFailed(
                "compaction inputs vanished: no snapshot exists".to_string(),
            ));
        };
        let mut metas = self.manifest_list.read(&latest.base_manifest_list)?;
        metas.extend(self.manifest_list.read(&latest.delta_manifest_list)?);
        let mut all = Vec::new();
        for meta in &metas {
            all.extend(self.manifest_file.read(&meta.file_name, None)?);
        }
        let live: std::collections::BTreeSet<_> = merge_entries(all)?
            .into_iter()
            .map(|entry| entry.identifier())
            .collect();
        for delete in deletes {
            if !live.contains(&delete.identifier()) {
                return Err(Error::CompactionFailed(format!(
                    "compaction input {} is no longer live in snapshot {}",
                    delete.file.file_name, latest.id
                )));
            }
        }
        Ok(())
    }

    fn new_scan(&self) -> FileStoreScan {
        FileStoreScan::new(
            self.snapshot_manager.clone(),
            ManifestFile::new(
                &self.table_dir,
                &self.schema,
                self.options.manifest_target_file_size,
            ),
            self.manifest_list.clone(),
            self.schema.clone(),
            self.num_buckets,
            self.options.scan_manifest_parallelism,
        )
        .with_kind(ScanKind::All)
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
