// kvrestore/src/metadata/mod.rs
//! Snapshot metadata: the schemas, table statistics, data segments and schema-change
//! history captured by a backup. Loaded once per restore run and read-only afterwards.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::errors::{RestoreError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub charset: Option<String>,
    #[serde(default)]
    pub collate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub id: i64,
    pub name: String,
    pub field_type: String,
    #[serde(default)]
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub indices: Vec<IndexInfo>,
    #[serde(default)]
    pub auto_inc_id: i64,
}

impl TableInfo {
    pub fn find_index(&self, name: &str) -> Option<&IndexInfo> {
        self.indices
            .iter()
            .find(|idx| idx.name.eq_ignore_ascii_case(name))
    }
}

/// One schema object recorded in the snapshot. Databases without tables appear with
/// `table: None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub db: DatabaseInfo,
    #[serde(default)]
    pub table: Option<TableInfo>,
    #[serde(default)]
    pub crc64xor: u64,
    #[serde(default)]
    pub total_kvs: u64,
    #[serde(default)]
    pub total_bytes: u64,
}

/// One physical unit of exported key-value data, named relative to the storage target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSegment {
    pub name: String,
    pub table_id: i64,
    #[serde(default, with = "hex_bytes")]
    pub start_key: Vec<u8>,
    #[serde(default, with = "hex_bytes")]
    pub end_key: Vec<u8>,
    #[serde(default)]
    pub cf: String,
    #[serde(default)]
    pub crc64xor: u64,
    #[serde(default)]
    pub total_kvs: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub size: u64,
}

/// A recorded schema change. `db_info` / `table_info` hold the identity of the object
/// after the change was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChangeEvent {
    pub id: i64,
    #[serde(default)]
    pub kind: String,
    pub schema_id: i64,
    #[serde(default)]
    pub table_id: i64,
    #[serde(default)]
    pub schema_name: String,
    pub query: String,
    pub schema_version: i64,
    #[serde(default)]
    pub db_info: Option<DatabaseInfo>,
    #[serde(default)]
    pub table_info: Option<TableInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    #[serde(default)]
    pub cluster_id: u64,
    #[serde(default)]
    pub start_version: u64,
    pub end_version: u64,
    #[serde(default)]
    pub files: Vec<DataSegment>,
    #[serde(default)]
    pub schemas: Vec<SchemaEntry>,
    #[serde(default)]
    pub ddls: Vec<SchemaChangeEvent>,
}

/// A table to restore together with its snapshot-time statistics and segments.
#[derive(Debug, Clone)]
pub struct Table {
    pub db: DatabaseInfo,
    pub info: TableInfo,
    pub crc64xor: u64,
    pub total_kvs: u64,
    pub total_bytes: u64,
    pub files: Vec<DataSegment>,
}

impl Table {
    pub fn qualified_name(&self) -> String {
        format!("`{}`.`{}`", self.db.name, self.info.name)
    }
}

#[derive(Debug, Clone)]
pub struct Database {
    pub info: DatabaseInfo,
    pub tables: Vec<Table>,
}

impl Database {
    pub fn get_table(&self, name: &str) -> Option<&Table> {
        self.tables
            .iter()
            .find(|t| t.info.name.eq_ignore_ascii_case(name))
    }
}

impl SnapshotMetadata {
    /// Parses and validates serialized metadata.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let meta: SnapshotMetadata = serde_json::from_slice(bytes)
            .map_err(|e| RestoreError::Metadata(format!("failed to parse snapshot metadata: {e}")))?;
        meta.validate()?;
        Ok(meta)
    }

    pub fn validate(&self) -> Result<()> {
        if self.end_version < self.start_version {
            return Err(RestoreError::Metadata(format!(
                "end version {} is older than start version {}",
                self.end_version, self.start_version
            )));
        }

        let mut db_ids: HashMap<String, i64> = HashMap::new();
        let mut seen_tables: HashSet<(String, String)> = HashSet::new();
        for entry in &self.schemas {
            let db_key = entry.db.name.to_lowercase();
            match db_ids.get(&db_key) {
                Some(id) if *id != entry.db.id => {
                    return Err(RestoreError::Metadata(format!(
                        "database '{}' recorded with ids {} and {}",
                        entry.db.name, id, entry.db.id
                    )));
                }
                Some(_) => {}
                None => {
                    db_ids.insert(db_key.clone(), entry.db.id);
                }
            }
            if let Some(table) = &entry.table {
                if !seen_tables.insert((db_key, table.name.to_lowercase())) {
                    return Err(RestoreError::Metadata(format!(
                        "table `{}`.`{}` recorded more than once",
                        entry.db.name, table.name
                    )));
                }
            }
        }

        if let Some(event) = self.ddls.iter().find(|e| e.query.trim().is_empty()) {
            return Err(RestoreError::Metadata(format!(
                "schema change {} (version {}) has no statement",
                event.id, event.schema_version
            )));
        }
        Ok(())
    }

    /// Whether this snapshot only covers changes since an earlier one.
    pub fn is_incremental(&self) -> bool {
        !(self.start_version == self.end_version || self.start_version == 0)
    }

    /// Groups schema entries into databases and attaches each segment to its table.
    ///
    /// Databases are keyed by lowercased name; the first spelling seen is kept.
    pub fn load_databases(&self) -> BTreeMap<String, Database> {
        let mut databases: BTreeMap<String, Database> = BTreeMap::new();
        let mut files_by_table: HashMap<i64, Vec<DataSegment>> = HashMap::new();
        for file in &self.files {
            files_by_table
                .entry(file.table_id)
                .or_default()
                .push(file.clone());
        }

        for entry in &self.schemas {
            let db = databases
                .entry(entry.db.name.to_lowercase())
                .or_insert_with(|| Database {
                    info: entry.db.clone(),
                    tables: Vec::new(),
                });
            if let Some(info) = &entry.table {
                db.tables.push(Table {
                    db: db.info.clone(),
                    info: info.clone(),
                    crc64xor: entry.crc64xor,
                    total_kvs: entry.total_kvs,
                    total_bytes: entry.total_bytes,
                    files: files_by_table.remove(&info.id).unwrap_or_default(),
                });
            }
        }

        for (table_id, files) in files_by_table {
            tracing::warn!(table_id, files = files.len(), "segments reference a table missing from the snapshot schema; skipping");
        }
        databases
    }

    /// History in replay order, ascending by schema version.
    pub fn sorted_ddls(&self) -> Vec<SchemaChangeEvent> {
        let mut ddls = self.ddls.clone();
        ddls.sort_by_key(|e| (e.schema_version, e.id));
        ddls
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim()).map_err(serde::de::Error::custom)
    }
}
