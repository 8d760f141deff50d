use std::fmt::Display;

/// Driftlake errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The record or table schema cannot be applied to the existing table.
    SchemaIncompatible(String),
    /// A manifest entry was written with a different total bucket count than
    /// the one currently in force. Rescaling requires a full overwrite.
    BucketCountMismatch { expected: u32, actual: u32 },
    /// Two live rows for the same primary key disagree on their location and
    /// no resolution policy applies. Raised during index bootstrap.
    DuplicateKey(String),
    /// The in-memory write buffer is full and cannot accept the record right
    /// now. Transient: retried after a flush or spill.
    BufferFull,
    /// A background compaction failed or its result became stale. Non-fatal:
    /// the inputs are retained and compaction retries next cycle.
    CompactionFailed(String),
    /// The proposed snapshot lost the race against a concurrent committer and
    /// the retry budget is exhausted.
    CommitConflict { latest: u64 },
    /// A manifest or manifest list file failed checksum or decode.
    CorruptManifest(String),
    /// A data file failed checksum or decode.
    CorruptDataFile(String),
    /// Invalid data, typically decoding errors or unexpected internal values.
    InvalidData(String),
    /// Invalid user input, typically configuration or record errors.
    InvalidInput(String),
    /// An IO error.
    Io(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::SchemaIncompatible(msg) => write!(f, "incompatible schema: {msg}"),
            Error::BucketCountMismatch { expected, actual } => write!(
                f,
                "bucket count mismatch: table has {expected} buckets but file was written \
                 with {actual}; perform a full overwrite to rescale"
            ),
            Error::DuplicateKey(msg) => write!(f, "duplicate primary key: {msg}"),
            Error::BufferFull => write!(f, "write buffer full, retry after flush"),
            Error::CompactionFailed(msg) => write!(f, "compaction failed: {msg}"),
            Error::CommitConflict { latest } => {
                write!(f, "commit conflict, latest snapshot is now {latest}")
            }
            Error::CorruptManifest(msg) => write!(f, "corrupt manifest: {msg}"),
            Error::CorruptDataFile(msg) => write!(f, "corrupt data file: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// A Driftlake Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
