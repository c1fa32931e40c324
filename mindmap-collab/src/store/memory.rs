//! In-process durable store.
//!
//! Backs tests and single-node development setups. A transaction records its
//! operations and `commit` applies them to a copy of the map's rows under one
//! lock, swapping the copy in only if every operation succeeded.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{DurableStore, MapRecord, StoreError, StoreTxn, Versioned};
use crate::model::{now_millis, ConnectionRecord, NodeRecord};

#[derive(Debug, Clone)]
struct MapRows {
    record: MapRecord,
    nodes: BTreeMap<String, Versioned<NodeRecord>>,
    connections: BTreeMap<String, Versioned<ConnectionRecord>>,
}

impl MapRows {
    fn new(map_id: &str) -> Self {
        let now = now_millis();
        Self {
            record: MapRecord {
                map_id: map_id.to_string(),
                created_at: now,
                updated_at: now,
            },
            nodes: BTreeMap::new(),
            connections: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
enum Op {
    CreateNodes(Vec<NodeRecord>),
    UpdateNode(NodeRecord),
    DeleteNodes(Vec<String>),
    CreateConnections(Vec<ConnectionRecord>),
    UpdateConnection(ConnectionRecord),
    DeleteConnections(Vec<String>),
    Touch,
}

fn put_versioned<T>(rows: &mut BTreeMap<String, Versioned<T>>, id: &str, row: T, now: u64) {
    let version = rows.get(id).map_or(1, |existing| existing.version + 1);
    rows.insert(
        id.to_string(),
        Versioned {
            row,
            version,
            updated_at: now,
        },
    );
}

#[derive(Default)]
pub struct MemoryStore {
    maps: Mutex<HashMap<String, MapRows>>,
    loads: AtomicU64,
    commits: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `list_nodes` calls served (one per document load).
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Number of committed transactions.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn connection_version(&self, map_id: &str, id: &str) -> Option<u64> {
        self.maps
            .lock()
            .get(map_id)
            .and_then(|rows| rows.connections.get(id))
            .map(|c| c.version)
    }

    pub fn map_exists(&self, map_id: &str) -> Result<bool, StoreError> {
        Ok(self.maps.lock().contains_key(map_id))
    }

    pub fn map_record(&self, map_id: &str) -> Result<Option<MapRecord>, StoreError> {
        Ok(self.maps.lock().get(map_id).map(|rows| rows.record.clone()))
    }

    /// Create the map record if it is missing.
    pub fn ensure_map(&self, map_id: &str) -> Result<MapRecord, StoreError> {
        let mut maps = self.maps.lock();
        let rows = maps
            .entry(map_id.to_string())
            .or_insert_with(|| MapRows::new(map_id));
        Ok(rows.record.clone())
    }

    /// Row version of a node, if it exists.
    pub fn node_version(&self, map_id: &str, node_id: &str) -> Result<Option<u64>, StoreError> {
        Ok(self
            .maps
            .lock()
            .get(map_id)
            .and_then(|rows| rows.nodes.get(node_id))
            .map(|n| n.version))
    }
}

impl DurableStore for MemoryStore {
    fn list_nodes(&self, map_id: &str) -> Result<Vec<NodeRecord>, StoreError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .maps
            .lock()
            .get(map_id)
            .map(|rows| rows.nodes.values().map(|v| v.row.clone()).collect())
            .unwrap_or_default())
    }

    fn list_connections(&self, map_id: &str) -> Result<Vec<ConnectionRecord>, StoreError> {
        Ok(self
            .maps
            .lock()
            .get(map_id)
            .map(|rows| rows.connections.values().map(|v| v.row.clone()).collect())
            .unwrap_or_default())
    }

    fn begin<'a>(&'a self, map_id: &str) -> Result<Box<dyn StoreTxn + 'a>, StoreError> {
        Ok(Box::new(MemoryTxn {
            store: self,
            map_id: map_id.to_string(),
            ops: Vec::new(),
        }))
    }
}

struct MemoryTxn<'a> {
    store: &'a MemoryStore,
    map_id: String,
    ops: Vec<Op>,
}

impl StoreTxn for MemoryTxn<'_> {
    fn create_nodes(&mut self, rows: &[NodeRecord]) -> Result<(), StoreError> {
        self.ops.push(Op::CreateNodes(rows.to_vec()));
        Ok(())
    }

    fn update_node(&mut self, row: &NodeRecord) -> Result<(), StoreError> {
        self.ops.push(Op::UpdateNode(row.clone()));
        Ok(())
    }

    fn delete_nodes(&mut self, ids: &[String]) -> Result<(), StoreError> {
        self.ops.push(Op::DeleteNodes(ids.to_vec()));
        Ok(())
    }

    fn create_connections(&mut self, rows: &[ConnectionRecord]) -> Result<(), StoreError> {
        self.ops.push(Op::CreateConnections(rows.to_vec()));
        Ok(())
    }

    fn update_connection(&mut self, row: &ConnectionRecord) -> Result<(), StoreError> {
        self.ops.push(Op::UpdateConnection(row.clone()));
        Ok(())
    }

    fn delete_connections(&mut self, ids: &[String]) -> Result<(), StoreError> {
        self.ops.push(Op::DeleteConnections(ids.to_vec()));
        Ok(())
    }

    fn touch_updated_at(&mut self) -> Result<(), StoreError> {
        self.ops.push(Op::Touch);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let now = now_millis();
        let mut maps = this.store.maps.lock();
        let mut rows = maps
            .get(&this.map_id)
            .cloned()
            .unwrap_or_else(|| MapRows::new(&this.map_id));

        for op in this.ops {
            match op {
                Op::CreateNodes(nodes) => {
                    for node in nodes {
                        let id = node.id.clone();
                        put_versioned(&mut rows.nodes, &id, node, now);
                    }
                }
                Op::UpdateNode(node) => {
                    let id = node.id.clone();
                    put_versioned(&mut rows.nodes, &id, node, now);
                }
                Op::DeleteNodes(ids) => {
                    for id in ids {
                        rows.nodes.remove(&id);
                    }
                }
                Op::CreateConnections(connections) => {
                    for connection in connections {
                        let id = connection.id.clone();
                        put_versioned(&mut rows.connections, &id, connection, now);
                    }
                }
                Op::UpdateConnection(connection) => {
                    let id = connection.id.clone();
                    put_versioned(&mut rows.connections, &id, connection, now);
                }
                Op::DeleteConnections(ids) => {
                    for id in ids {
                        rows.connections.remove(&id);
                    }
                }
                Op::Touch => rows.record.updated_at = now,
            }
        }

        maps.insert(this.map_id, rows);
        this.store.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
