//! RocksDB-backed snapshot cache.
//!
//! Survives process restarts, which is what the pending snapshot needs.
//! Value layout:
//! ```text
//! ┌─────────────────────┬──────────────────────────────┐
//! │ expires_at (ms, BE) │ LZ4 block (size-prepended)   │
//! │ 8 bytes, 0 = never  │ variable                     │
//! └─────────────────────┴──────────────────────────────┘
//! ```
//! Expired entries read as absent and are deleted on that read.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteOptions,
};

use super::{CacheError, SnapshotCache};
use crate::model::now_millis;

const CF_SNAPSHOTS: &str = "snapshots";
const HEADER_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// fsync every write
    pub sync_writes: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("mindmap_data/cache"),
            block_cache_size: 64 * 1024 * 1024, // 64MB
            sync_writes: false,
        }
    }
}

impl CacheConfig {
    /// Create config for testing (small cache, given directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024, // 4MB
            sync_writes: false,
        }
    }
}

pub struct RocksCache {
    db: DBWithThreadMode<SingleThreaded>,
    config: CacheConfig,
}

impl RocksCache {
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_keep_log_file_num(3);

        let mut cf_opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        cf_opts.set_block_based_table_factory(&block_opts);
        // Values are already LZ4 blocks
        cf_opts.set_compression_type(DBCompressionType::None);
        cf_opts.optimize_for_point_lookup(config.block_cache_size as u64);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_SNAPSHOTS, cf_opts)],
        )?;

        Ok(Self { db, config })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, CacheError> {
        self.db
            .cf_handle(CF_SNAPSHOTS)
            .ok_or_else(|| CacheError::Backend(format!("Column family '{CF_SNAPSHOTS}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

impl SnapshotCache for RocksCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let cf = self.cf()?;
        let raw = match self.db.get_cf(cf, key.as_bytes())? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        if raw.len() < HEADER_LEN {
            return Err(CacheError::Corrupt {
                key: key.to_string(),
                reason: format!("{} bytes is shorter than the header", raw.len()),
            });
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&raw[..HEADER_LEN]);
        let expires_at = u64::from_be_bytes(header);
        if expires_at != 0 && expires_at <= now_millis() {
            self.db.delete_cf_opt(cf, key.as_bytes(), &self.write_options())?;
            return Ok(None);
        }

        lz4_flex::decompress_size_prepended(&raw[HEADER_LEN..])
            .map(Some)
            .map_err(|e| CacheError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        let cf = self.cf()?;
        let expires_at = ttl.map_or(0, |ttl| now_millis() + ttl.as_millis() as u64);
        let compressed = lz4_flex::compress_prepend_size(value);

        let mut raw = Vec::with_capacity(HEADER_LEN + compressed.len());
        raw.extend_from_slice(&expires_at.to_be_bytes());
        raw.extend_from_slice(&compressed);

        self.db.put_cf_opt(cf, key.as_bytes(), &raw, &self.write_options())?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        let cf = self.cf()?;
        self.db.delete_cf_opt(cf, key.as_bytes(), &self.write_options())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RocksCache::open(CacheConfig::for_testing(dir.path())).unwrap();

        assert!(cache.get("yjs:state:m1").unwrap().is_none());
        cache.set("yjs:state:m1", b"snapshot bytes", None).unwrap();
        assert_eq!(
            cache.get("yjs:state:m1").unwrap().as_deref(),
            Some(&b"snapshot bytes"[..])
        );

        cache.delete("yjs:state:m1").unwrap();
        assert!(cache.get("yjs:state:m1").unwrap().is_none());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 7) as u8).collect();
        {
            let cache = RocksCache::open(CacheConfig::for_testing(dir.path())).unwrap();
            cache
                .set("yjs:pending:m1", &payload, Some(Duration::from_secs(3600)))
                .unwrap();
        }

        let cache = RocksCache::open(CacheConfig::for_testing(dir.path())).unwrap();
        assert_eq!(cache.get("yjs:pending:m1").unwrap(), Some(payload));
    }

    #[test]
    fn test_expired_entry_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RocksCache::open(CacheConfig::for_testing(dir.path())).unwrap();

        cache.set("short", b"v", Some(Duration::from_millis(1))).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.get("short").unwrap().is_none());
        // Removed on read
        let cf = cache.cf().unwrap();
        assert!(cache.db.get_cf(cf, b"short").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RocksCache::open(CacheConfig::for_testing(dir.path())).unwrap();
        let cf = cache.cf().unwrap();
        cache.db.put_cf(cf, b"bad", [1u8, 2, 3]).unwrap();

        assert!(matches!(
            cache.get("bad"),
            Err(CacheError::Corrupt { .. })
        ));
    }
}
