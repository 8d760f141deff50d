//! Table schema and its JSON persistence.
//!
//! A schema is an ordered list of typed fields plus the partition and primary
//! key column lists and the option map in force when the schema was created.
//! Schemas are immutable; evolution writes a new `schema-<id>` descriptor.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::data::{Datum, Row};
use crate::encoding::keycode;
use crate::error::{Error, Result};

pub const SCHEMA_DIR: &str = "schema";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Boolean,
    Int,
    Float,
    String,
    Bytes,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataField {
    pub id: i32,
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub id: u64,
    pub fields: Vec<DataField>,
    pub partition_keys: Vec<String>,
    pub primary_keys: Vec<String>,
    pub options: BTreeMap<String, String>,
    pub highest_field_id: i32,
}

impl TableSchema {
    pub fn new(
        fields: Vec<(&str, DataType)>,
        partition_keys: Vec<&str>,
        primary_keys: Vec<&str>,
        options: BTreeMap<String, String>,
    ) -> Result<Self> {
        let fields: Vec<DataField> = fields
            .into_iter()
            .enumerate()
            .map(|(i, (name, data_type))| DataField {
                id: i as i32,
                name: name.to_string(),
                data_type,
            })
            .collect();
        let schema = Self {
            id: 0,
            highest_field_id: fields.len() as i32 - 1,
            fields,
            partition_keys: partition_keys.into_iter().map(String::from).collect(),
            primary_keys: primary_keys.into_iter().map(String::from).collect(),
            options,
        };
        schema.validate()?;
        Ok(schema)
    }

    fn validate(&self) -> Result<()> {
        for key in self.partition_keys.iter().chain(&self.primary_keys) {
            if self.field_index(key).is_none() {
                return Err(Error::SchemaIncompatible(format!(
                    "key column {key:?} not found in schema fields"
                )));
            }
        }
        if !self.primary_keys.is_empty() && self.trimmed_primary_keys().is_empty() {
            return Err(Error::SchemaIncompatible(
                "primary key cannot be exactly the partition key".to_string(),
            ));
        }
        Ok(())
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field_indices(&self, names: &[String]) -> Vec<usize> {
        names
            .iter()
            .filter_map(|name| self.field_index(name))
            .collect()
    }

    /// Primary key columns minus partition columns; the key stored in data
    /// files and the global index.
    pub fn trimmed_primary_keys(&self) -> Vec<String> {
        self.primary_keys
            .iter()
            .filter(|k| !self.partition_keys.contains(k))
            .cloned()
            .collect()
    }

    /// True when primary-key uniqueness must be enforced across partitions:
    /// the primary key does not contain every partition column.
    pub fn cross_partition_update(&self) -> bool {
        !self.primary_keys.is_empty()
            && !self
                .partition_keys
                .iter()
                .all(|k| self.primary_keys.contains(k))
    }

    /// Columns hashed for static bucket routing.
    pub fn bucket_keys(&self, configured: &[String]) -> Vec<String> {
        if !configured.is_empty() {
            return configured.to_vec();
        }
        self.trimmed_primary_keys()
    }

    /// Encodes the trimmed primary key of `row`.
    pub fn extract_key(&self, row: &Row) -> Vec<u8> {
        let indices = self.field_indices(&self.trimmed_primary_keys());
        keycode::encode_projected(row, &indices)
    }

    /// Encodes the partition tuple of `row`.
    pub fn extract_partition(&self, row: &Row) -> Vec<u8> {
        let indices = self.field_indices(&self.partition_keys);
        keycode::encode_projected(row, &indices)
    }

    /// Decodes a partition payload back into partition column values.
    pub fn decode_partition(&self, partition: &[u8]) -> Result<Row> {
        keycode::decode_fields(partition, self.partition_keys.len())
    }

    /// Overwrites the partition columns of `row` with the values encoded in
    /// `partition`.
    pub fn rewrite_partition(&self, row: &mut Row, partition: &[u8]) -> Result<()> {
        let values = self.decode_partition(partition)?;
        for (key, value) in self.partition_keys.iter().zip(values) {
            let index = self.field_index(key).ok_or_else(|| {
                Error::SchemaIncompatible(format!("partition column {key:?} missing"))
            })?;
            row[index] = value;
        }
        Ok(())
    }

    /// Renders a partition payload as nested `col=value` path segments.
    pub fn partition_path(&self, partition: &[u8]) -> Result<String> {
        let values = self.decode_partition(partition)?;
        let mut path = String::new();
        for (key, value) in self.partition_keys.iter().zip(values) {
            path.push_str(key);
            path.push('=');
            match value {
                None => path.push_str("null"),
                Some(Datum::Bool(b)) => path.push_str(if b { "true" } else { "false" }),
                Some(Datum::Int(i)) => path.push_str(&i.to_string()),
                Some(Datum::Float(f)) => path.push_str(&f.to_string()),
                Some(Datum::String(s)) => path.push_str(&s),
                Some(Datum::Bytes(b)) => {
                    for byte in b {
                        path.push_str(&format!("{byte:02x}"));
                    }
                }
            }
            path.push('/');
        }
        Ok(path)
    }
}

/// Persists schemas as JSON descriptors under `<table>/schema/`.
pub struct SchemaManager {
    schema_dir: PathBuf,
}

impl SchemaManager {
    pub fn new(table_dir: impl AsRef<Path>) -> Self {
        Self {
            schema_dir: table_dir.as_ref().join(SCHEMA_DIR),
        }
    }

    pub fn commit(&self, schema: &TableSchema) -> Result<()> {
        fs::create_dir_all(&self.schema_dir)?;
        let path = self.schema_path(schema.id);
        if path.exists() {
            return Err(Error::SchemaIncompatible(format!(
                "schema {} already exists",
                schema.id
            )));
        }
        let json = serde_json::to_string_pretty(schema)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn schema(&self, id: u64) -> Result<TableSchema> {
        let json = fs::read_to_string(self.schema_path(id))?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn latest(&self) -> Result<Option<TableSchema>> {
        let mut latest: Option<u64> = None;
        if !self.schema_dir.exists() {
            return Ok(None);
        }
        for entry in fs::read_dir(&self.schema_dir)? {
            let name = entry?.file_name();
            if let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix("schema-"))
                .and_then(|n| n.parse::<u64>().ok())
            {
                latest = Some(latest.map_or(id, |cur: u64| cur.max(id)));
            }
        }
        latest.map(|id| self.schema(id)).transpose()
    }

    fn schema_path(&self, id: u64) -> PathBuf {
        self.schema_dir.join(format!("schema-{id}"))
    }
}
