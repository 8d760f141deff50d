//! Sorted-run bookkeeping per (partition, bucket).
//!
//! Level 0 holds freshly flushed files whose key ranges overlap freely; each
//! file is its own sorted run. Every level >= 1 holds at most one sorted run
//! of non-overlapping files.

use crate::error::{Error, Result};
use crate::file::DataFileMeta;

/// One merge input for compaction picking: a level-0 file or a whole upper
/// level.
#[derive(Clone, Debug)]
pub struct LevelSortedRun {
    pub level: usize,
    pub files: Vec<DataFileMeta>,
}

impl LevelSortedRun {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.file_size).sum()
    }
}

#[derive(Debug)]
pub struct Levels {
    /// Newest first (by max sequence).
    level0: Vec<DataFileMeta>,
    /// `upper[i]` is the run of level `i + 1`, sorted by min key.
    upper: Vec<Vec<DataFileMeta>>,
    num_levels: usize,
}

impl Levels {
    pub fn new(files: impl IntoIterator<Item = DataFileMeta>, num_levels: usize) -> Self {
        let mut levels = Self {
            level0: Vec::new(),
            upper: vec![Vec::new(); num_levels.saturating_sub(1)],
            num_levels,
        };
        for file in files {
            levels.add_file(file);
        }
        levels
    }

    pub fn max_level(&self) -> usize {
        self.num_levels - 1
    }

    fn add_file(&mut self, file: DataFileMeta) {
        if file.level == 0 {
            let position = self
                .level0
                .partition_point(|f| f.max_sequence > file.max_sequence);
            self.level0.insert(position, file);
        } else {
            let level = file.level.min(self.max_level());
            let run = &mut self.upper[level - 1];
            let position = run.partition_point(|f| f.min_key < file.min_key);
            run.insert(position, file);
        }
    }

    pub fn add_level0_file(&mut self, file: DataFileMeta) {
        debug_assert_eq!(file.level, 0);
        self.add_file(file);
    }

    /// Applies a finished compaction: drops its inputs, adds its outputs.
    pub fn update(&mut self, before: &[DataFileMeta], after: &[DataFileMeta]) {
        let removed: Vec<&str> = before.iter().map(|f| f.file_name.as_str()).collect();
        self.level0
            .retain(|f| !removed.contains(&f.file_name.as_str()));
        for run in &mut self.upper {
            run.retain(|f| !removed.contains(&f.file_name.as_str()));
        }
        for file in after {
            self.add_file(file.clone());
        }
    }

    /// Level-0 files plus non-empty upper levels.
    pub fn num_sorted_runs(&self) -> usize {
        self.level0.len() + self.upper.iter().filter(|run| !run.is_empty()).count()
    }

    /// Merge inputs ordered newest-to-oldest: level-0 runs by descending max
    /// sequence, then the upper levels ascending.
    pub fn run_candidates(&self) -> Vec<LevelSortedRun> {
        let mut runs: Vec<LevelSortedRun> = self
            .level0
            .iter()
            .map(|file| LevelSortedRun {
                level: 0,
                files: vec![file.clone()],
            })
            .collect();
        for (index, run) in self.upper.iter().enumerate() {
            if !run.is_empty() {
                runs.push(LevelSortedRun {
                    level: index + 1,
                    files: run.clone(),
                });
            }
        }
        runs
    }

    pub fn all_files(&self) -> Vec<DataFileMeta> {
        let mut files = self.level0.clone();
        for run in &self.upper {
            files.extend(run.iter().cloned());
        }
        files
    }

    pub fn is_empty(&self) -> bool {
        self.level0.is_empty() && self.upper.iter().all(|run| run.is_empty())
    }

    /// Validates the upper-level invariant: strictly increasing,
    /// non-overlapping key ranges within each run.
    pub fn check_run_invariants(&self) -> Result<()> {
        for (index, run) in self.upper.iter().enumerate() {
            for pair in run.windows(2) {
                if pair[1].min_key <= pair[0].max_key {
                    return Err(Error::InvalidData(format!(
                        "overlapping files at level {}: {} and {}",
                        index + 1,
                        pair[0].file_name,
                        pair[1].file_name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn file(name: &str, level: usize, size: u64, max_seq: u64) -> DataFileMeta {
        DataFileMeta {
            file_name: name.to_string(),
            file_size: size,
            row_count: 1,
            min_key: name.as_bytes().to_vec(),
            max_key: name.as_bytes().to_vec(),
            key_stats: vec![],
            value_stats: vec![],
            min_sequence: 0,
            max_sequence: max_seq,
            schema_id: 0,
            level,
            extra_files: vec![],
            creation_time: 0,
        }
    }

    #[test]
    fn test_run_counting() {
        let levels = Levels::new(
            vec![
                file("a", 0, 10, 3),
                file("b", 0, 10, 5),
                file("c", 1, 100, 1),
                file("d", 2, 100, 1),
                file("e", 2, 100, 1),
            ],
            4,
        );
        // Two L0 files + L1 + L2 = 4 runs.
        assert_eq!(levels.num_sorted_runs(), 4);

        let runs = levels.run_candidates();
        assert_eq!(runs.len(), 4);
        // Newest L0 first.
        assert_eq!(runs[0].files[0].file_name, "b");
        assert_eq!(runs[1].files[0].file_name, "a");
        assert_eq!(runs[2].level, 1);
        assert_eq!(runs[3].level, 2);
        assert_eq!(runs[3].files.len(), 2);
    }

    #[test]
    fn test_update_moves_files() {
        let mut levels = Levels::new(
            vec![file("a", 0, 10, 1), file("b", 0, 10, 2)],
            4,
        );
        let merged = file("m", 1, 20, 2);
        levels.update(&levels.all_files(), &[merged.clone()]);
        assert_eq!(levels.num_sorted_runs(), 1);
        assert_eq!(levels.all_files(), vec![merged]);
    }

    #[test]
    fn test_invariant_check() {
        let mut good = Levels::new(vec![], 3);
        let mut left = file("a", 1, 10, 1);
        left.min_key = vec![1];
        left.max_key = vec![5];
        let mut right = file("b", 1, 10, 1);
        right.min_key = vec![6];
        right.max_key = vec![9];
        good.update(&[], &[left.clone(), right.clone()]);
        assert!(good.check_run_invariants().is_ok());

        let mut bad = Levels::new(vec![], 3);
        right.min_key = vec![4];
        bad.update(&[], &[left, right]);
        assert!(bad.check_run_invariants().is_err());
    }
}
