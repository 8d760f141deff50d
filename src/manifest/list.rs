//! Manifest lists and manifest file metadata.
//!
//! A snapshot does not reference manifest files directly; it names one
//! manifest-list file per section (base / delta / changelog), and the list
//! holds the metadata of each manifest file including aggregated partition
//! statistics used for pruning before any manifest is opened.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::encoding::{read_frame, write_frame};
use crate::error::{Error, Result};
use crate::file::FieldStats;

const LIST_MAGIC: &[u8; 4] = b"DLML";
const VERSION: u8 = 1;

/// Metadata of one manifest file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestFileMeta {
    pub file_name: String,
    pub file_size: u64,
    pub num_added_files: u64,
    pub num_deleted_files: u64,
    /// Per-partition-column stats aggregated over every entry in the file.
    pub partition_stats: Vec<FieldStats>,
    pub schema_id: u64,
}

/// Reads and writes manifest-list files under `<table>/manifest/`.
#[derive(Clone, Debug)]
pub struct ManifestList {
    manifest_dir: PathBuf,
}

impl ManifestList {
    pub fn new(table_dir: impl AsRef<Path>) -> Self {
        Self {
            manifest_dir: table_dir.as_ref().join(super::MANIFEST_DIR),
        }
    }

    pub fn write(&self, metas: &[ManifestFileMeta]) -> Result<String> {
        std::fs::create_dir_all(&self.manifest_dir)?;
        let file_name = format!("manifest-list-{}", Uuid::new_v4());
        let path = self.manifest_dir.join(&file_name);
        let mut writer = BufWriter::new(File::create(&path)?);
        writer.write_all(LIST_MAGIC)?;
        writer.write_u8(VERSION)?;
        for meta in metas {
            let payload = bincode::serialize(meta)?;
            write_frame(&mut writer, &payload)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(file_name)
    }

    pub fn read(&self, file_name: &str) -> Result<Vec<ManifestFileMeta>> {
        let path = self.manifest_dir.join(file_name);
        let corrupt = |detail: String| Error::CorruptManifest(format!("{file_name}: {detail}"));
        let mut reader = BufReader::new(File::open(&path)?);

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|e| corrupt(e.to_string()))?;
        if &magic != LIST_MAGIC {
            return Err(corrupt("bad magic bytes".to_string()));
        }
        let version = reader.read_u8()?;
        if version != VERSION {
            return Err(corrupt(format!("unsupported version {version}")));
        }

        let mut metas = Vec::new();
        while let Some(payload) = read_frame(&mut reader).map_err(|e| corrupt(e.to_string()))? {
            metas.push(bincode::deserialize(&payload).map_err(|e| corrupt(e.to_string()))?);
        }
        Ok(metas)
    }
}
