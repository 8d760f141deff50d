//! The bucketed LSM merge tree.
//!
//! One [`MergeTreeWriter`] owns one (partition, bucket): it buffers records,
//! flushes level-0 files, and keeps the sorted-run count bounded through
//! background universal compaction.
//!
//! ```text
//! write ──► sort buffer ──flush──► level 0 (overlapping files)
//!                                     │ compaction (loser tree + merge fn)
//!                                     ▼
//!                                  level 1..N (one sorted run each)
//! ```

pub mod compact;
pub mod levels;
pub mod loser_tree;
pub mod merge;
pub mod writer;

pub use compact::{pick_compaction, CompactExecutor, CompactRequest, CompactResult, CompactUnit};
pub use levels::{LevelSortedRun, Levels};
pub use loser_tree::{KeyValueIter, LoserTree, LoserTreeIter};
pub use merge::{FieldAggregator, MergeFunction, SequenceGenerator};
pub use writer::{CommitIncrement, MergeTreeWriter};
