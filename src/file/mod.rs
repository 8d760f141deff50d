//! Immutable key-value data files and their statistics.

pub mod data_file;
pub mod stats;

pub use data_file::{
    DataFileMeta, DataFilePathFactory, KeyValueFileReader, KeyValueFileWriter, RollingFileWriter,
};
pub use stats::{FieldStats, StatsCollector};
