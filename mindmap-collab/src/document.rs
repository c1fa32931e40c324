//! Mergeable mind-map document.
//!
//! `MindMapDoc` wraps a Yrs `Doc` holding two root maps:
//!
//! ```text
//! Doc
//!  ├── "nodes"        id → NodeRecord (JSON)
//!  └── "connections"  id → ConnectionRecord (JSON)
//! ```
//!
//! Every mutation is tagged with an [`UpdateOrigin`]. Observers receive the
//! encoded update together with its origin after the transaction commits, in
//! commit order. The origin is what lets the session decide whether an update
//! is fanned out, relayed, or both.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use thiserror::Error;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Map, MapRef, ReadTxn, StateVector, Transact, TransactionMut, Update};

use crate::model::{ConnectionRecord, NodeRecord};

pub const NODES_MAP: &str = "nodes";
pub const CONNECTIONS_MAP: &str = "connections";

#[derive(Error, Debug)]
pub enum DocError {
    #[error("Failed to decode update: {0}")]
    Decode(String),
    #[error("Failed to decode state vector: {0}")]
    StateVector(String),
    #[error("Failed to apply update: {0}")]
    Apply(String),
    #[error("Failed to observe document: {0}")]
    Observe(String),
    #[error("Failed to encode row: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Identity of one client socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a document change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Edit made in this process (server-side edit, or local edit on a client)
    Local,
    /// Update received from a client socket
    Connection(ConnectionId),
    /// Update replayed from another instance (or from the server, on a client)
    Remote,
}

type UpdateCallback = Arc<dyn Fn(&[u8], UpdateOrigin) + Send + Sync>;

#[derive(Default)]
struct ObserverHub {
    next_id: AtomicU64,
    observers: Mutex<Vec<(u64, UpdateCallback)>>,
}

impl ObserverHub {
    fn dispatch(&self, update: &[u8], origin: UpdateOrigin) {
        // Snapshot so callbacks may subscribe/unsubscribe
        let observers: Vec<UpdateCallback> =
            self.observers.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for callback in observers {
            callback(update, origin);
        }
    }
}

/// Handle returned by [`MindMapDoc::observe`]. Dropping it unsubscribes.
pub struct UpdateSubscription {
    id: u64,
    hub: Weak<ObserverHub>,
}

impl Drop for UpdateSubscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.observers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// Consistent view of the document taken under a single read.
#[derive(Debug, Clone, Default)]
pub struct DocSnapshot {
    pub nodes: BTreeMap<String, NodeRecord>,
    pub connections: BTreeMap<String, ConnectionRecord>,
    pub state: Vec<u8>,
}

/// The mind-map CRDT document.
pub struct MindMapDoc {
    doc: Doc,
    nodes: MapRef,
    connections: MapRef,
    hub: Arc<ObserverHub>,
    /// Updates emitted by the transaction being committed
    captured: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Serializes all access; reentrant so observers can read the document
    gate: ReentrantMutex<()>,
    _capture: yrs::Subscription,
}

impl MindMapDoc {
    pub fn new() -> Result<Self, DocError> {
        let doc = Doc::new();
        let nodes = doc.get_or_insert_map(NODES_MAP);
        let connections = doc.get_or_insert_map(CONNECTIONS_MAP);

        let captured: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let capture = doc
            .observe_update_v1(move |_, event| {
                sink.lock().push(event.update.clone());
            })
            .map_err(|e| DocError::Observe(format!("{e:?}")))?;

        Ok(Self {
            doc,
            nodes,
            connections,
            hub: Arc::new(ObserverHub::default()),
            captured,
            gate: ReentrantMutex::new(()),
            _capture: capture,
        })
    }

    /// Register an update observer.
    pub fn observe<F>(&self, callback: F) -> UpdateSubscription
    where
        F: Fn(&[u8], UpdateOrigin) + Send + Sync + 'static,
    {
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed);
        self.hub.observers.lock().push((id, Arc::new(callback)));
        UpdateSubscription {
            id,
            hub: Arc::downgrade(&self.hub),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.hub.observers.lock().len()
    }

    /// Run a write transaction, then hand every update it produced to the
    /// observers tagged with `origin`.
    fn commit<R>(
        &self,
        origin: UpdateOrigin,
        f: impl FnOnce(&mut TransactionMut) -> Result<R, DocError>,
    ) -> Result<R, DocError> {
        let _gate = self.gate.lock();
        let result = {
            let mut txn = self.doc.transact_mut();
            f(&mut txn)
        };
        let updates = std::mem::take(&mut *self.captured.lock());
        for update in &updates {
            self.hub.dispatch(update, origin);
        }
        result
    }

    // ─── Sync primitives ─────────────────────────────────────────────

    /// Full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let _gate = self.gate.lock();
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        let _gate = self.gate.lock();
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this document has that the peer described by
    /// `remote_state_vector` is missing.
    pub fn diff_update(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| DocError::StateVector(e.to_string()))?;
        let _gate = self.gate.lock();
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Merge an encoded update. Applying the same update twice is a no-op.
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<(), DocError> {
        let decoded = Update::decode_v1(update).map_err(|e| DocError::Decode(e.to_string()))?;
        self.commit(origin, |txn| {
            txn.apply_update(decoded)
                .map_err(|e| DocError::Apply(e.to_string()))
        })
    }

    // ─── Rows ────────────────────────────────────────────────────────

    pub fn upsert_node(&self, node: &NodeRecord, origin: UpdateOrigin) -> Result<(), DocError> {
        let json = serde_json::to_string(node)?;
        self.commit(origin, |txn| {
            self.nodes.insert(txn, node.id.as_str(), json);
            Ok(())
        })
    }

    pub fn remove_node(&self, id: &str, origin: UpdateOrigin) -> Result<bool, DocError> {
        self.commit(origin, |txn| Ok(self.nodes.remove(txn, id).is_some()))
    }

    pub fn upsert_connection(
        &self,
        connection: &ConnectionRecord,
        origin: UpdateOrigin,
    ) -> Result<(), DocError> {
        let json = serde_json::to_string(connection)?;
        self.commit(origin, |txn| {
            self.connections.insert(txn, connection.id.as_str(), json);
            Ok(())
        })
    }

    pub fn remove_connection(&self, id: &str, origin: UpdateOrigin) -> Result<bool, DocError> {
        self.commit(origin, |txn| Ok(self.connections.remove(txn, id).is_some()))
    }

    /// Insert many rows in one transaction (one update, one observer call).
    pub fn populate(
        &self,
        nodes: &[NodeRecord],
        connections: &[ConnectionRecord],
        origin: UpdateOrigin,
    ) -> Result<(), DocError> {
        let nodes = nodes
            .iter()
            .map(|n| Ok((n.id.clone(), serde_json::to_string(n)?)))
            .collect::<Result<Vec<_>, DocError>>()?;
        let connections = connections
            .iter()
            .map(|c| Ok((c.id.clone(), serde_json::to_string(c)?)))
            .collect::<Result<Vec<_>, DocError>>()?;

        self.commit(origin, |txn| {
            for (id, json) in nodes {
                self.nodes.insert(txn, id, json);
            }
            for (id, json) in connections {
                self.connections.insert(txn, id, json);
            }
            Ok(())
        })
    }

    pub fn node(&self, id: &str) -> Option<NodeRecord> {
        let _gate = self.gate.lock();
        let txn = self.doc.transact();
        read_row(&self.nodes, &txn, id)
    }

    pub fn nodes(&self) -> BTreeMap<String, NodeRecord> {
        let _gate = self.gate.lock();
        let txn = self.doc.transact();
        read_rows(&self.nodes, &txn)
    }

    pub fn connections(&self) -> BTreeMap<String, ConnectionRecord> {
        let _gate = self.gate.lock();
        let txn = self.doc.transact();
        read_rows(&self.connections, &txn)
    }

    /// Rows and encoded state from the same read, so they describe the same
    /// version of the document.
    pub fn snapshot(&self) -> DocSnapshot {
        let _gate = self.gate.lock();
        let txn = self.doc.transact();
        DocSnapshot {
            nodes: read_rows(&self.nodes, &txn),
            connections: read_rows(&self.connections, &txn),
            state: txn.encode_state_as_update_v1(&StateVector::default()),
        }
    }

    pub fn is_empty(&self) -> bool {
        let _gate = self.gate.lock();
        let txn = self.doc.transact();
        self.nodes.len(&txn) == 0 && self.connections.len(&txn) == 0
    }
}

fn read_row<T, R>(map: &MapRef, txn: &R, id: &str) -> Option<T>
where
    T: serde::de::DeserializeOwned,
    R: ReadTxn,
{
    let json = map.get(txn, id).and_then(|v| v.cast::<String>().ok())?;
    match serde_json::from_str(&json) {
        Ok(row) => Some(row),
        Err(e) => {
            log::warn!("Skipping unreadable row {id}: {e}");
            None
        }
    }
}

fn read_rows<T, R>(map: &MapRef, txn: &R) -> BTreeMap<String, T>
where
    T: serde::de::DeserializeOwned,
    R: ReadTxn,
{
    let keys: Vec<String> = map.keys(txn).map(String::from).collect();
    keys.into_iter()
        .filter_map(|id| read_row(map, txn, &id).map(|row| (id, row)))
        .collect()
}
