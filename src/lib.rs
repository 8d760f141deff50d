//! Driftlake: the write path of a streaming lakehouse table engine.
//!
//! Change-data-capture records (insert / update-before / update-after /
//! delete) are routed to bucketed LSM merge trees, flushed as immutable data
//! files, and published through an immutable manifest tree under
//! monotonically numbered snapshots.
//!
//! ```text
//! records ──► bucket routing ──► merge-tree writer ──► data files
//!                 │ (global index for                      │
//!                 │  cross-partition keys)                 ▼
//!                 │                               manifest entries
//!                 │                                        │
//!                 ▼                                        ▼
//!           key → (partition, bucket)          snapshot-<n> (commit)
//! ```
//!
//! | Module        | Purpose                                             |
//! |---------------|-----------------------------------------------------|
//! | [`mergetree`] | Per-bucket buffer, flush, universal compaction      |
//! | [`index`]     | Global primary-key index + dynamic bucket assigner  |
//! | [`manifest`]  | Immutable ADD/DELETE metadata tree                  |
//! | [`snapshot`]  | Snapshot descriptors, LATEST/EARLIEST, rollback     |
//! | [`commit`]    | Optimistic snapshot commits with conflict retry     |
//! | [`scan`]      | Manifest-driven planning with pushdown              |
//! | [`sort`]      | External sort for buffering and index bootstrap     |
//! | [`table`]     | Write / commit / read façade                        |

pub mod commit;
pub mod config;
pub mod data;
pub mod encoding;
pub mod error;
pub mod file;
pub mod hasher;
pub mod index;
pub mod manifest;
pub mod memory;
pub mod mergetree;
pub mod predicate;
pub mod scan;
pub mod schema;
pub mod snapshot;
pub mod sort;
pub mod table;

#[cfg(test)]
pub mod tmpfs;

pub use commit::{CommitMessage, FileStoreCommit, ManifestCommittable};
pub use config::{ChangelogProducer, CoreOptions, MergeEngine};
pub use data::{CdcRecord, Datum, KeyValue, Row, RowKind};
pub use error::{Error, Result};
pub use schema::{DataField, DataType, TableSchema};
pub use snapshot::{CommitKind, Snapshot, SnapshotManager};
pub use table::{FileStoreTable, TableCommit, TableWrite};
