//! RocksDB-backed durable store.
//!
//! Column families:
//! - `maps`        — map records (bincode), keyed by map id
//! - `nodes`       — versioned node rows (bincode), keyed by `mapId 0x1F nodeId`
//! - `connections` — versioned connection rows, keyed like nodes
//!
//! A transaction is one `WriteBatch`; nothing reaches the database until
//! `commit` writes the batch atomically.

use std::path::{Path, PathBuf};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{DurableStore, MapRecord, StoreError, StoreTxn, Versioned};
use crate::model::{now_millis, ConnectionRecord, NodeRecord};

const CF_MAPS: &str = "maps";
const CF_NODES: &str = "nodes";
const CF_CONNECTIONS: &str = "connections";

const COLUMN_FAMILIES: &[&str] = &[CF_MAPS, CF_NODES, CF_CONNECTIONS];

/// Separates map id from row id in row keys.
const KEY_SEPARATOR: u8 = 0x1F;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every commit (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("mindmap_data/store"),
            block_cache_size: 128 * 1024 * 1024, // 128MB
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024, // 32MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, given directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn row_prefix(map_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(map_id.len() + 1);
    key.extend_from_slice(map_id.as_bytes());
    key.push(KEY_SEPARATOR);
    key
}

fn row_key(map_id: &str, row_id: &str) -> Vec<u8> {
    let mut key = row_prefix(map_id);
    key.extend_from_slice(row_id.as_bytes());
    key
}

/// RocksDB-backed row store.
pub struct RocksStore {
    /// Column families are all created at open
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_MAPS => {
                // Small values, point lookups only
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_NODES | CF_CONNECTIONS => {
                // Prefix-scanned by map id on every document load
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// All rows of one map in one column family, in key order.
    fn scan<T: DeserializeOwned>(&self, cf_name: &str, map_id: &str) -> Result<Vec<T>, StoreError> {
        let cf = self.cf(cf_name)?;
        let prefix = row_prefix(map_id);
        let mut rows = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            rows.push(decode(&value)?);
        }
        Ok(rows)
    }

    fn get_row<T: DeserializeOwned>(
        &self,
        cf_name: &str,
        map_id: &str,
        row_id: &str,
    ) -> Result<Option<T>, StoreError> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, row_key(map_id, row_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn map_exists(&self, map_id: &str) -> Result<bool, StoreError> {
        Ok(self.map_record(map_id)?.is_some())
    }

    pub fn map_record(&self, map_id: &str) -> Result<Option<MapRecord>, StoreError> {
        let cf = self.cf(CF_MAPS)?;
        match self.db.get_cf(cf, map_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Create the map record if it is missing.
    pub fn ensure_map(&self, map_id: &str) -> Result<MapRecord, StoreError> {
        if let Some(record) = self.map_record(map_id)? {
            return Ok(record);
        }
        let now = now_millis();
        let record = MapRecord {
            map_id: map_id.to_string(),
            created_at: now,
            updated_at: now,
        };
        let cf = self.cf(CF_MAPS)?;
        self.db
            .put_cf_opt(cf, map_id.as_bytes(), encode(&record)?, &self.write_options())?;
        Ok(record)
    }

    /// Row version of a node, if it exists.
    pub fn node_version(&self, map_id: &str, node_id: &str) -> Result<Option<u64>, StoreError> {
        let row: Option<Versioned<NodeRecord>> = self.get_row(CF_NODES, map_id, node_id)?;
        Ok(row.map(|v| v.version))
    }
}

impl DurableStore for RocksStore {
    fn list_nodes(&self, map_id: &str) -> Result<Vec<NodeRecord>, StoreError> {
        let rows: Vec<Versioned<NodeRecord>> = self.scan(CF_NODES, map_id)?;
        Ok(rows.into_iter().map(|v| v.row).collect())
    }

    fn list_connections(&self, map_id: &str) -> Result<Vec<ConnectionRecord>, StoreError> {
        let rows: Vec<Versioned<ConnectionRecord>> = self.scan(CF_CONNECTIONS, map_id)?;
        Ok(rows.into_iter().map(|v| v.row).collect())
    }

    fn begin<'a>(&'a self, map_id: &str) -> Result<Box<dyn StoreTxn + 'a>, StoreError> {
        Ok(Box::new(RocksTxn {
            store: self,
            map_id: map_id.to_string(),
            batch: WriteBatch::default(),
            now: now_millis(),
        }))
    }
}

struct RocksTxn<'a> {
    store: &'a RocksStore,
    map_id: String,
    batch: WriteBatch,
    now: u64,
}

impl RocksTxn<'_> {
    /// Stage a row write, bumping the version of an existing row.
    fn put_versioned<T>(&mut self, cf_name: &str, row_id: &str, row: &T) -> Result<(), StoreError>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        let existing: Option<Versioned<T>> = self.store.get_row(cf_name, &self.map_id, row_id)?;
        let versioned = Versioned {
            row: row.clone(),
            version: existing.map_or(1, |v| v.version + 1),
            updated_at: self.now,
        };
        let cf = self.store.cf(cf_name)?;
        self.batch
            .put_cf(cf, row_key(&self.map_id, row_id), encode(&versioned)?);
        Ok(())
    }

    fn delete_rows(&mut self, cf_name: &str, ids: &[String]) -> Result<(), StoreError> {
        let cf = self.store.cf(cf_name)?;
        for id in ids {
            self.batch.delete_cf(cf, row_key(&self.map_id, id));
        }
        Ok(())
    }
}

impl StoreTxn for RocksTxn<'_> {
    fn create_nodes(&mut self, rows: &[NodeRecord]) -> Result<(), StoreError> {
        for row in rows {
            self.put_versioned(CF_NODES, &row.id, row)?;
        }
        Ok(())
    }

    fn update_node(&mut self, row: &NodeRecord) -> Result<(), StoreError> {
        self.put_versioned(CF_NODES, &row.id, row)
    }

    fn delete_nodes(&mut self, ids: &[String]) -> Result<(), StoreError> {
        self.delete_rows(CF_NODES, ids)
    }

    fn create_connections(&mut self, rows: &[ConnectionRecord]) -> Result<(), StoreError> {
        for row in rows {
            self.put_versioned(CF_CONNECTIONS, &row.id, row)?;
        }
        Ok(())
    }

    fn update_connection(&mut self, row: &ConnectionRecord) -> Result<(), StoreError> {
        self.put_versioned(CF_CONNECTIONS, &row.id, row)
    }

    fn delete_connections(&mut self, ids: &[String]) -> Result<(), StoreError> {
        self.delete_rows(CF_CONNECTIONS, ids)
    }

    fn touch_updated_at(&mut self) -> Result<(), StoreError> {
        let record = match self.store.map_record(&self.map_id)? {
            Some(mut record) => {
                record.updated_at = self.now;
                record
            }
            None => MapRecord {
                map_id: self.map_id.clone(),
                created_at: self.now,
                updated_at: self.now,
            },
        };
        let cf = self.store.cf(CF_MAPS)?;
        self.batch.put_cf(cf, self.map_id.as_bytes(), encode(&record)?);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.store.db.write_opt(this.batch, &this.store.write_options())?;
        Ok(())
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
