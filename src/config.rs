//! Table configuration.
//!
//! Externally the table carries a loose string key/value map (it travels with
//! the schema). That map is parsed exactly once into the typed [`CoreOptions`]
//! struct; under strict mode unknown keys are rejected instead of ignored.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{Error, Result};

pub const BUCKET: &str = "bucket";
pub const BUCKET_KEY: &str = "bucket-key";
pub const WRITE_BUFFER_SIZE: &str = "write-buffer-size";
pub const WRITE_BUFFER_SPILLABLE: &str = "write-buffer-spillable";
pub const COMPACTION_TRIGGER: &str = "num-sorted-run.compaction-trigger";
pub const STOP_TRIGGER: &str = "num-sorted-run.stop-trigger";
pub const NUM_LEVELS: &str = "num-levels";
pub const COMPACTION_SIZE_RATIO: &str = "compaction.size-ratio";
pub const CHANGELOG_PRODUCER: &str = "changelog-producer";
pub const MERGE_ENGINE: &str = "merge-engine";
pub const PARTIAL_UPDATE_IGNORE_DELETE: &str = "partial-update.ignore-delete";
pub const SEQUENCE_FIELD: &str = "sequence.field";
pub const CROSS_PARTITION_INDEX_TTL: &str = "cross-partition-upsert.index-ttl";
pub const DYNAMIC_BUCKET_TARGET_ROW_NUM: &str = "dynamic-bucket.target-row-num";
pub const LOCAL_SORT_MAX_NUM_FILE_HANDLES: &str = "local-sort.max-num-file-handles";
pub const TARGET_FILE_SIZE: &str = "target-file-size";
pub const MANIFEST_TARGET_FILE_SIZE: &str = "manifest.target-file-size";
pub const MANIFEST_MERGE_MIN_COUNT: &str = "manifest.merge-min-count";
pub const SCAN_MANIFEST_PARALLELISM: &str = "scan.manifest.parallelism";
pub const SNAPSHOT_NUM_RETAINED_MIN: &str = "snapshot.num-retained.min";
pub const SNAPSHOT_NUM_RETAINED_MAX: &str = "snapshot.num-retained.max";
pub const SNAPSHOT_TIME_RETAINED: &str = "snapshot.time-retained";

const FIELDS_PREFIX: &str = "fields.";
const SEQUENCE_GROUP_SUFFIX: &str = ".sequence-group";
const AGGREGATE_FUNCTION_SUFFIX: &str = ".aggregate-function";

/// The per-key reducer applied during compaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeEngine {
    Deduplicate,
    PartialUpdate,
    Aggregate,
    FirstRow,
}

/// How changelog files are produced alongside data files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangelogProducer {
    None,
    Input,
    FullCompaction,
    Lookup,
}

/// Typed table options, parsed once from the external key/value map.
#[derive(Clone, Debug)]
pub struct CoreOptions {
    /// Static bucket count, or -1 for dynamic bucket mode.
    pub bucket: i32,
    /// Columns hashed for bucket routing; defaults to the trimmed primary key.
    pub bucket_key: Vec<String>,
    /// Memory per writer before flush or spill.
    pub write_buffer_size: usize,
    /// Spill the write buffer to disk instead of flushing inline.
    pub write_buffer_spillable: bool,
    pub num_sorted_run_compaction_trigger: usize,
    num_sorted_run_stop_trigger: Option<usize>,
    pub num_levels: usize,
    /// Universal compaction size-ratio percentage.
    pub compaction_size_ratio: usize,
    pub changelog_producer: ChangelogProducer,
    pub merge_engine: MergeEngine,
    pub partial_update_ignore_delete: bool,
    /// Column holding user-supplied sequence numbers, if any.
    pub sequence_field: Option<String>,
    /// `fields.<field>.sequence-group` entries: (sequence field, members).
    pub sequence_groups: Vec<(String, Vec<String>)>,
    /// `fields.<field>.aggregate-function` entries.
    pub field_aggregates: Vec<(String, String)>,
    pub cross_partition_index_ttl: Option<Duration>,
    pub dynamic_bucket_target_row_num: u64,
    pub local_sort_max_num_file_handles: usize,
    /// Target size for rolled data files.
    pub target_file_size: u64,
    pub manifest_target_file_size: u64,
    pub manifest_merge_min_count: usize,
    pub scan_manifest_parallelism: usize,
    // Snapshot expiration knobs are recognised but acted on by a separate
    // maintenance task, not by the write path.
    pub snapshot_num_retained_min: usize,
    pub snapshot_num_retained_max: usize,
    pub snapshot_time_retained: Duration,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            bucket: 1,
            bucket_key: Vec::new(),
            write_buffer_size: 64 * 1024 * 1024,
            write_buffer_spillable: false,
            num_sorted_run_compaction_trigger: 5,
            num_sorted_run_stop_trigger: None,
            num_levels: 6,
            compaction_size_ratio: 1,
            changelog_producer: ChangelogProducer::None,
            merge_engine: MergeEngine::Deduplicate,
            partial_update_ignore_delete: false,
            sequence_field: None,
            sequence_groups: Vec::new(),
            field_aggregates: Vec::new(),
            cross_partition_index_ttl: None,
            dynamic_bucket_target_row_num: 2_000_000,
            local_sort_max_num_file_handles: 128,
            target_file_size: 128 * 1024 * 1024,
            manifest_target_file_size: 8 * 1024 * 1024,
            manifest_merge_min_count: 30,
            scan_manifest_parallelism: 8,
            snapshot_num_retained_min: 10,
            snapshot_num_retained_max: usize::MAX,
            snapshot_time_retained: Duration::from_secs(60 * 60),
        }
    }
}

impl CoreOptions {
    /// Parses the external option map. Under `strict`, unknown keys are an
    /// error instead of being ignored.
    pub fn from_map(map: &BTreeMap<String, String>, strict: bool) -> Result<Self> {
        let mut options = Self::default();
        for (key, value) in map {
            match key.as_str() {
                BUCKET => options.bucket = parse(key, value)?,
                BUCKET_KEY => options.bucket_key = parse_list(value),
                WRITE_BUFFER_SIZE => options.write_buffer_size = parse(key, value)?,
                WRITE_BUFFER_SPILLABLE => options.write_buffer_spillable = parse(key, value)?,
                COMPACTION_TRIGGER => {
                    options.num_sorted_run_compaction_trigger = parse(key, value)?
                }
                STOP_TRIGGER => options.num_sorted_run_stop_trigger = Some(parse(key, value)?),
                NUM_LEVELS => options.num_levels = parse(key, value)?,
                COMPACTION_SIZE_RATIO => options.compaction_size_ratio = parse(key, value)?,
                CHANGELOG_PRODUCER => {
                    options.changelog_producer = match value.as_str() {
                        "none" => ChangelogProducer::None,
                        "input" => ChangelogProducer::Input,
                        "full-compaction" => ChangelogProducer::FullCompaction,
                        "lookup" => ChangelogProducer::Lookup,
                        other => {
                            return Err(Error::InvalidInput(format!(
                                "unknown changelog producer {other:?}"
                            )))
                        }
                    }
                }
                MERGE_ENGINE => {
                    options.merge_engine = match value.as_str() {
                        "deduplicate" => MergeEngine::Deduplicate,
                        "partial-update" => MergeEngine::PartialUpdate,
                        "aggregate" => MergeEngine::Aggregate,
                        "first-row" => MergeEngine::FirstRow,
                        other => {
                            return Err(Error::InvalidInput(format!(
                                "unknown merge engine {other:?}"
                            )))
                        }
                    }
                }
                PARTIAL_UPDATE_IGNORE_DELETE => {
                    options.partial_update_ignore_delete = parse(key, value)?
                }
                SEQUENCE_FIELD => options.sequence_field = Some(value.clone()),
                CROSS_PARTITION_INDEX_TTL => {
                    options.cross_partition_index_ttl =
                        Some(Duration::from_millis(parse(key, value)?))
                }
                DYNAMIC_BUCKET_TARGET_ROW_NUM => {
                    options.dynamic_bucket_target_row_num = parse(key, value)?
                }
                LOCAL_SORT_MAX_NUM_FILE_HANDLES => {
                    options.local_sort_max_num_file_handles = parse(key, value)?
                }
                TARGET_FILE_SIZE => options.target_file_size = parse(key, value)?,
                MANIFEST_TARGET_FILE_SIZE => {
                    options.manifest_target_file_size = parse(key, value)?
                }
                MANIFEST_MERGE_MIN_COUNT => {
                    options.manifest_merge_min_count = parse(key, value)?
                }
                SCAN_MANIFEST_PARALLELISM => {
                    options.scan_manifest_parallelism = parse(key, value)?
                }
                SNAPSHOT_NUM_RETAINED_MIN => {
                    options.snapshot_num_retained_min = parse(key, value)?
                }
                SNAPSHOT_NUM_RETAINED_MAX => {
                    options.snapshot_num_retained_max = parse(key, value)?
                }
                SNAPSHOT_TIME_RETAINED => {
                    options.snapshot_time_retained = Duration::from_millis(parse(key, value)?)
                }
                other if other.starts_with(FIELDS_PREFIX)
                    && other.ends_with(SEQUENCE_GROUP_SUFFIX) =>
                {
                    let field = other
                        [FIELDS_PREFIX.len()..other.len() - SEQUENCE_GROUP_SUFFIX.len()]
                        .to_string();
                    options.sequence_groups.push((field, parse_list(value)));
                }
                other if other.starts_with(FIELDS_PREFIX)
                    && other.ends_with(AGGREGATE_FUNCTION_SUFFIX) =>
                {
                    let field = other
                        [FIELDS_PREFIX.len()..other.len() - AGGREGATE_FUNCTION_SUFFIX.len()]
                        .to_string();
                    options.field_aggregates.push((field, value.clone()));
                }
                other => {
                    if strict {
                        return Err(Error::InvalidInput(format!(
                            "unknown table option {other:?}"
                        )));
                    }
                }
            }
        }

        options.validate()?;
        Ok(options)
    }

    fn validate(&self) -> Result<()> {
        if self.bucket == 0 || self.bucket < -1 {
            return Err(Error::InvalidInput(format!(
                "bucket must be positive or -1 (dynamic), got {}",
                self.bucket
            )));
        }
        if self.num_sorted_run_compaction_trigger < 2 {
            return Err(Error::InvalidInput(
                "num-sorted-run.compaction-trigger must be at least 2".to_string(),
            ));
        }
        if self.num_sorted_run_stop_trigger() < self.num_sorted_run_compaction_trigger {
            return Err(Error::InvalidInput(
                "num-sorted-run.stop-trigger must not be below the compaction trigger".to_string(),
            ));
        }
        if self.num_levels < 2 {
            return Err(Error::InvalidInput(
                "num-levels must be at least 2".to_string(),
            ));
        }
        Ok(())
    }

    /// Write-stall threshold; defaults to one above the compaction trigger.
    pub fn num_sorted_run_stop_trigger(&self) -> usize {
        self.num_sorted_run_stop_trigger
            .unwrap_or(self.num_sorted_run_compaction_trigger + 1)
    }

    pub fn dynamic_bucket(&self) -> bool {
        self.bucket == -1
    }

    pub fn max_level(&self) -> usize {
        self.num_levels - 1
    }

    // Builder-style setters, mostly for tests.

    pub fn with_bucket(mut self, bucket: i32) -> Self {
        self.bucket = bucket;
        self
    }

    pub fn with_merge_engine(mut self, engine: MergeEngine) -> Self {
        self.merge_engine = engine;
        self
    }

    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn with_compaction_trigger(mut self, trigger: usize, stop: usize) -> Self {
        self.num_sorted_run_compaction_trigger = trigger;
        self.num_sorted_run_stop_trigger = Some(stop);
        self
    }

    pub fn with_changelog_producer(mut self, producer: ChangelogProducer) -> Self {
        self.changelog_producer = producer;
        self
    }

    pub fn with_dynamic_bucket_target_row_num(mut self, target: u64) -> Self {
        self.dynamic_bucket_target_row_num = target;
        self
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::InvalidInput(format!("invalid value {value:?} for option {key:?}")))
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let options = CoreOptions::default();
        assert_eq!(options.num_sorted_run_compaction_trigger, 5);
        assert_eq!(options.num_sorted_run_stop_trigger(), 6);
        assert_eq!(options.merge_engine, MergeEngine::Deduplicate);
        assert!(!options.dynamic_bucket());
    }

    #[test]
    fn test_parse_options() -> Result<()> {
        let options = CoreOptions::from_map(
            &map(&[
                ("bucket", "-1"),
                ("bucket-key", "id, region"),
                ("merge-engine", "partial-update"),
                ("changelog-producer", "input"),
                ("num-sorted-run.compaction-trigger", "3"),
                ("dynamic-bucket.target-row-num", "3"),
                ("fields.g1.sequence-group", "a,b"),
                ("fields.total.aggregate-function", "sum"),
            ]),
            true,
        )?;
        assert!(options.dynamic_bucket());
        assert_eq!(options.bucket_key, vec!["id", "region"]);
        assert_eq!(options.merge_engine, MergeEngine::PartialUpdate);
        assert_eq!(options.changelog_producer, ChangelogProducer::Input);
        assert_eq!(options.num_sorted_run_stop_trigger(), 4);
        assert_eq!(options.dynamic_bucket_target_row_num, 3);
        assert_eq!(
            options.sequence_groups,
            vec![("g1".to_string(), vec!["a".to_string(), "b".to_string()])]
        );
        assert_eq!(
            options.field_aggregates,
            vec![("total".to_string(), "sum".to_string())]
        );
        Ok(())
    }

    #[test]
    fn test_unknown_key_strict() {
        let result = CoreOptions::from_map(&map(&[("no-such-option", "1")]), true);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(CoreOptions::from_map(&map(&[("no-such-option", "1")]), false).is_ok());
    }

    #[test]
    fn test_invalid_values() {
        assert!(CoreOptions::from_map(&map(&[("bucket", "0")]), true).is_err());
        assert!(CoreOptions::from_map(&map(&[("bucket", "abc")]), true).is_err());
        assert!(
            CoreOptions::from_map(
                &map(&[
                    ("num-sorted-run.compaction-trigger", "5"),
                    ("num-sorted-run.stop-trigger", "4"),
                ]),
                true,
            )
            .is_err()
        );
    }
}
