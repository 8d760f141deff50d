//! Embedded ordered key-value store backing the global index.
//!
//! A lock-free skiplist holds the working set; every mutation is appended to
//! a framed log so an assigner can restart without a full re-bootstrap. Bulk
//! loading takes a pre-sorted stream, which is how the bootstrap path feeds
//! the store from the external sorter. Entries carry an insertion stamp for
//! the optional TTL: expired keys are dropped lazily on lookup.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_skiplist::SkipMap;
use serde::{Deserialize, Serialize};

use crate::encoding::{read_frame, write_frame};
use crate::error::{Error, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Stored {
    value: Vec<u8>,
    stamp_millis: u64,
}

pub struct IndexKv {
    map: SkipMap<Vec<u8>, Stored>,
    log: Mutex<BufWriter<File>>,
    ttl: Option<Duration>,
}

impl IndexKv {
    /// Opens the store, replaying any existing log.
    pub fn open(path: impl AsRef<Path>, ttl: Option<Duration>) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let map = SkipMap::new();
        if path.exists() {
            let mut reader = BufReader::new(File::open(&path)?);
            while let Some(payload) = read_frame(&mut reader)? {
                let (key, stored): (Vec<u8>, Stored) = bincode::deserialize(&payload)?;
                map.insert(key, stored);
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            map,
            log: Mutex::new(BufWriter::new(file)),
            ttl,
        })
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let entry = self.map.get(key)?;
        if self.expired(entry.value().stamp_millis) {
            entry.remove();
            return None;
        }
        Some(entry.value().value.clone())
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let stored = Stored {
            value,
            stamp_millis: unix_millis(),
        };
        self.append_log(&key, &stored)?;
        self.map.insert(key, stored);
        Ok(())
    }

    /// Loads a pre-sorted stream of unique keys. Out-of-order input is a
    /// caller bug and is rejected.
    pub fn bulk_load(&self, entries: impl Iterator<Item = (Vec<u8>, Vec<u8>)>) -> Result<()> {
        let mut previous: Option<Vec<u8>> = None;
        let stamp = unix_millis();
        for (key, value) in entries {
            if let Some(previous) = &previous {
                if key <= *previous {
                    return Err(Error::InvalidData(
                        "bulk load input must be sorted by unique key".to_string(),
                    ));
                }
            }
            let stored = Stored {
                value,
                stamp_millis: stamp,
            };
            self.append_log(&key, &stored)?;
            previous = Some(key.clone());
            self.map.insert(key, stored);
        }
        self.sync()?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let mut log = self.log.lock()?;
        log.flush()?;
        log.get_ref().sync_all()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn append_log(&self, key: &[u8], stored: &Stored) -> Result<()> {
        let payload = bincode::serialize(&(key, stored))?;
        let mut log = self.log.lock()?;
        write_frame(&mut *log, &payload)?;
        Ok(())
    }

    fn expired(&self, stamp_millis: u64) -> bool {
        match self.ttl {
            None => false,
            Some(ttl) => unix_millis().saturating_sub(stamp_millis) > ttl.as_millis() as u64,
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_put_get() -> Result<()> {
        let dir = TempDir::new()?;
        let kv = IndexKv::open(dir.path().join("index"), None)?;

        assert_eq!(kv.get(b"k1"), None);
        kv.put(b"k1".to_vec(), b"v1".to_vec())?;
        kv.put(b"k1".to_vec(), b"v2".to_vec())?;
        assert_eq!(kv.get(b"k1"), Some(b"v2".to_vec()));
        assert_eq!(kv.len(), 1);
        Ok(())
    }

    #[test]
    fn test_log_replay_restores_state() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("index");
        {
            let kv = IndexKv::open(&path, None)?;
            kv.put(b"a".to_vec(), b"1".to_vec())?;
            kv.put(b"b".to_vec(), b"2".to_vec())?;
            kv.sync()?;
        }
        let kv = IndexKv::open(&path, None)?;
        assert_eq!(kv.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(kv.get(b"b"), Some(b"2".to_vec()));
        Ok(())
    }

    #[test]
    fn test_bulk_load_requires_sorted_input() -> Result<()> {
        let dir = TempDir::new()?;
        let kv = IndexKv::open(dir.path().join("index"), None)?;

        kv.bulk_load(
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
            ]
            .into_iter(),
        )?;
        assert_eq!(kv.len(), 2);

        let unsorted = vec![
            (b"z".to_vec(), b"1".to_vec()),
            (b"y".to_vec(), b"2".to_vec()),
        ];
        assert!(kv.bulk_load(unsorted.into_iter()).is_err());
        Ok(())
    }

    #[test]
    fn test_ttl_expires_entries() -> Result<()> {
        let dir = TempDir::new()?;
        let kv = IndexKv::open(dir.path().join("index"), Some(Duration::from_millis(0)))?;
        kv.put(b"k".to_vec(), b"v".to_vec())?;
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(kv.get(b"k"), None);
        assert!(kv.is_empty());
        Ok(())
    }
}
