//! Durable relational store for mind-map rows.
//!
//! ```text
//! ┌────────────────────┐   diff    ┌──────────────────────────────┐
//! │ PersistenceCoord.  │ ────────► │ DurableStore                 │
//! │ (doc ↔ store diff) │  one txn  │  maps         created/updated│
//! └────────────────────┘           │  nodes        per-row version│
//!                                  │  connections  per-row version│
//!                                  └──────────────────────────────┘
//! ```
//!
//! Reconciliation writes all of its changes through one [`StoreTxn`]; a
//! transaction dropped without `commit` leaves the store untouched.

pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ConnectionRecord, NodeRecord};

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Row not found: {0}")]
    NotFound(String),
    #[error("Transaction rejected: {0}")]
    Rejected(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Map-level metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapRecord {
    pub map_id: String,
    /// Milliseconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

/// A row as the store keeps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub row: T,
    /// Starts at 1, incremented on every update
    pub version: u64,
    pub updated_at: u64,
}

/// Persistent row storage. Existence and authorization of maps are decided
/// elsewhere; this interface only reads and writes rows.
pub trait DurableStore: Send + Sync {
    fn list_nodes(&self, map_id: &str) -> Result<Vec<NodeRecord>, StoreError>;

    fn list_connections(&self, map_id: &str) -> Result<Vec<ConnectionRecord>, StoreError>;

    /// Start a transaction scoped to one map.
    fn begin<'a>(&'a self, map_id: &str) -> Result<Box<dyn StoreTxn + 'a>, StoreError>;
}

/// A batch of row changes applied atomically by `commit`.
pub trait StoreTxn {
    fn create_nodes(&mut self, rows: &[NodeRecord]) -> Result<(), StoreError>;

    fn update_node(&mut self, row: &NodeRecord) -> Result<(), StoreError>;

    fn delete_nodes(&mut self, ids: &[String]) -> Result<(), StoreError>;

    fn create_connections(&mut self, rows: &[ConnectionRecord]) -> Result<(), StoreError>;

    fn update_connection(&mut self, row: &ConnectionRecord) -> Result<(), StoreError>;

    fn delete_connections(&mut self, ids: &[String]) -> Result<(), StoreError>;

    /// Bump the map's `updated_at`, creating the map record if needed.
    fn touch_updated_at(&mut self) -> Result<(), StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
