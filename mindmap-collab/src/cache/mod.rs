//! Snapshot cache: key → bytes with optional expiry.
//!
//! Holds two snapshots per map:
//! ```text
//! {prefix}state:{mapId}    written after a successful reconciliation, no TTL
//! {prefix}pending:{mapId}  written on every scheduled change, TTL 1h
//! ```
//! The pending snapshot is what makes a crash between an edit and its
//! reconciliation recoverable.

pub mod rocks;

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;

pub use rocks::{CacheConfig, RocksCache};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),
    #[error("Corrupt cache entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<rocksdb::Error> for CacheError {
    fn from(e: rocksdb::Error) -> Self {
        CacheError::Backend(e.to_string())
    }
}

/// Byte cache used for document snapshots.
pub trait SnapshotCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store `value`; with a `ttl` the entry disappears once it elapses.
    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError>;

    fn delete(&self, key: &str) -> Result<(), CacheError>;
}

struct CachedValue {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

/// In-process cache. Expiry follows the tokio clock, so paused-time tests
/// can observe it.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CachedValue>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unexpired entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|v| v.expires_at.map_or(true, |at| at > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some(value) => value.expires_at.is_some_and(|at| at <= Instant::now()),
        };
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|v| v.bytes.clone()))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.lock().insert(
            key.to_string(),
            CachedValue {
                bytes: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
