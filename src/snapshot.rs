//! Snapshot descriptors and the snapshot directory.
//!
//! A snapshot is an immutable JSON document naming the manifest lists that
//! make up one committed version of the table. Snapshot ids are gap-free
//! increasing integers; `LATEST` and `EARLIEST` are plain-text hint files
//! rewritten atomically (temp file + rename) and always re-validated against
//! the directory on read.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const SNAPSHOT_DIR: &str = "snapshot";
pub const LATEST: &str = "LATEST";
pub const EARLIEST: &str = "EARLIEST";

/// Snapshot format version. Snapshots older than version 3 have no changelog
/// manifest list; their APPEND deltas double as changelog.
pub const CURRENT_VERSION: u32 = 3;
pub const VERSION_WITHOUT_CHANGELOG: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommitKind {
    Append,
    Compact,
    Overwrite,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u32,
    pub id: u64,
    pub schema_id: u64,
    pub base_manifest_list: String,
    pub delta_manifest_list: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog_manifest_list: Option<String>,
    pub commit_user: String,
    /// Caller-provided identifier correlating this commit with an external
    /// checkpoint.
    pub commit_identifier: u64,
    pub commit_kind: CommitKind,
    pub time_millis: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_offsets: Option<std::collections::BTreeMap<u32, u64>>,
    pub total_record_count: u64,
    pub delta_record_count: i64,
    pub changelog_record_count: u64,
}

/// Resolves, reads and writes snapshots under `<table>/snapshot/`.
#[derive(Clone, Debug)]
pub struct SnapshotManager {
    snapshot_dir: PathBuf,
}

impl SnapshotManager {
    pub fn new(table_dir: impl AsRef<Path>) -> Self {
        Self {
            snapshot_dir: table_dir.as_ref().join(SNAPSHOT_DIR),
        }
    }

    pub fn snapshot_path(&self, id: u64) -> PathBuf {
        self.snapshot_dir.join(format!("snapshot-{id}"))
    }

    pub fn snapshot(&self, id: u64) -> Result<Snapshot> {
        let json = fs::read_to_string(self.snapshot_path(id))?;
        serde_json::from_str(&json)
            .map_err(|e| Error::CorruptManifest(format!("snapshot-{id}: {e}")))
    }

    pub fn snapshot_exists(&self, id: u64) -> bool {
        self.snapshot_path(id).exists()
    }

    pub fn latest_snapshot(&self) -> Result<Option<Snapshot>> {
        self.latest_snapshot_id()?
            .map(|id| self.snapshot(id))
            .transpose()
    }

    /// Latest committed snapshot id. The `LATEST` hint is advisory: a hinted
    /// id is trusted only when the next id is not present, otherwise the
    /// directory is scanned.
    pub fn latest_snapshot_id(&self) -> Result<Option<u64>> {
        if let Some(hinted) = self.read_hint(LATEST)? {
            if self.snapshot_exists(hinted) && !self.snapshot_exists(hinted + 1) {
                return Ok(Some(hinted));
            }
        }
        self.scan_ids(|ids| ids.into_iter().max())
    }

    pub fn earliest_snapshot_id(&self) -> Result<Option<u64>> {
        if let Some(hinted) = self.read_hint(EARLIEST)? {
            if self.snapshot_exists(hinted) {
                return Ok(Some(hinted));
            }
        }
        self.scan_ids(|ids| ids.into_iter().min())
    }

    /// Atomically proposes `snapshot` as the next snapshot. Returns false
    /// when another committer already claimed the id.
    pub fn try_commit(&self, snapshot: &Snapshot) -> Result<bool> {
        fs::create_dir_all(&self.snapshot_dir)?;
        let path = self.snapshot_path(snapshot.id);
        // create_new is the arbiter: exactly one committer wins the name.
        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let mut file = file;
        file.write_all(serde_json::to_string_pretty(snapshot)?.as_bytes())?;
        file.sync_all()?;

        self.write_hint(LATEST, snapshot.id)?;
        if snapshot.id == 1 {
            self.write_hint(EARLIEST, 1)?;
        }
        Ok(true)
    }

    /// Truncates the snapshot tail above `id`. Data and manifest files
    /// referenced only by the removed snapshots become orphans, reclaimed by
    /// the expiration task.
    pub fn rollback_to(&self, id: u64) -> Result<()> {
        if !self.snapshot_exists(id) {
            return Err(Error::InvalidInput(format!(
                "cannot roll back to missing snapshot {id}"
            )));
        }
        let latest = self
            .latest_snapshot_id()?
            .ok_or_else(|| Error::InvalidInput("table has no snapshots".to_string()))?;
        for stale in (id + 1)..=latest {
            let path = self.snapshot_path(stale);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        self.write_hint(LATEST, id)?;
        tracing::info!(rollback_to = id, truncated_from = latest, "Rolled back snapshots");
        Ok(())
    }

    fn read_hint(&self, name: &str) -> Result<Option<u64>> {
        match fs::read_to_string(self.snapshot_dir.join(name)) {
            Ok(content) => Ok(content.trim().parse().ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_hint(&self, name: &str, id: u64) -> Result<()> {
        let path = self.snapshot_dir.join(name);
        let tmp = self.snapshot_dir.join(format!("{name}.tmp"));
        fs::write(&tmp, id.to_string())?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn scan_ids(&self, pick: impl FnOnce(Vec<u64>) -> Option<u64>) -> Result<Option<u64>> {
        if !self.snapshot_dir.exists() {
            return Ok(None);
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.snapshot_dir)? {
            let name = entry?.file_name();
            if let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix("snapshot-"))
                .and_then(|n| n.parse().ok())
            {
                ids.push(id);
            }
        }
        Ok(pick(ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn snapshot(id: u64) -> Snapshot {
        Snapshot {
            version: CURRENT_VERSION,
            id,
            schema_id: 0,
            base_manifest_list: format!("manifest-list-base-{id}"),
            delta_manifest_list: format!("manifest-list-delta-{id}"),
            changelog_manifest_list: None,
            commit_user: "test".to_string(),
            commit_identifier: id,
            commit_kind: CommitKind::Append,
            time_millis: 0,
            log_offsets: None,
            total_record_count: 0,
            delta_record_count: 0,
            changelog_record_count: 0,
        }
    }

    #[test]
    fn test_commit_and_read() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = SnapshotManager::new(dir.path());
        assert_eq!(manager.latest_snapshot_id()?, None);

        assert!(manager.try_commit(&snapshot(1))?);
        assert!(manager.try_commit(&snapshot(2))?);
        assert_eq!(manager.latest_snapshot_id()?, Some(2));
        assert_eq!(manager.earliest_snapshot_id()?, Some(1));
        assert_eq!(manager.snapshot(2)?, snapshot(2));
        Ok(())
    }

    #[test]
    fn test_concurrent_commit_loses_race() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = SnapshotManager::new(dir.path());
        assert!(manager.try_commit(&snapshot(1))?);
        // A second proposal of the same id must observe the conflict.
        assert!(!manager.try_commit(&snapshot(1))?);
        Ok(())
    }

    #[test]
    fn test_stale_latest_hint_is_corrected() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = SnapshotManager::new(dir.path());
        assert!(manager.try_commit(&snapshot(1))?);
        assert!(manager.try_commit(&snapshot(2))?);

        // Simulate a crashed committer that never updated the hint.
        manager.write_hint(LATEST, 1)?;
        assert_eq!(manager.latest_snapshot_id()?, Some(2));
        Ok(())
    }

    #[test]
    fn test_rollback_truncates_tail() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = SnapshotManager::new(dir.path());
        for id in 1..=5 {
            assert!(manager.try_commit(&snapshot(id))?);
        }

        manager.rollback_to(3)?;
        assert_eq!(manager.latest_snapshot_id()?, Some(3));
        assert!(!manager.snapshot_exists(4));
        assert!(!manager.snapshot_exists(5));

        // The next commit renumbers from 4.
        assert!(manager.try_commit(&snapshot(4))?);
        assert_eq!(manager.latest_snapshot_id()?, Some(4));

        assert!(manager.rollback_to(9).is_err());
        Ok(())
    }
}
