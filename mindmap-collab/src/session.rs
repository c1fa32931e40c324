//! One live editing session per mind map.
//!
//! A session owns the map's document, its connected clients, awareness
//! state and fan-out channel, plus the two timers that drive it: the
//! persistence debounce and the destroy grace period. Sessions are created
//! and torn down by [`crate::registry::SessionRegistry`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::awareness::{AwarenessChange, AwarenessError, AwarenessRegistry};
use crate::broadcast::{BroadcastGroup, RoomFrame};
use crate::config::SyncConfig;
use crate::document::{ConnectionId, DocError, MindMapDoc, UpdateOrigin, UpdateSubscription};
use crate::persistence::DebounceTimer;
use crate::protocol::Frame;
use crate::relay::RelaySubscription;

#[derive(Debug, Clone, Copy)]
struct ClientInfo {
    joined_at: Instant,
}

/// Observer and relay listener; dropped together on dispose.
struct Wiring {
    _observer: UpdateSubscription,
    _relay: Option<RelaySubscription>,
}

pub struct Session {
    map_id: String,
    room_name: String,
    doc: MindMapDoc,
    awareness: Mutex<AwarenessRegistry>,
    clients: Mutex<HashMap<ConnectionId, ClientInfo>>,
    fanout: BroadcastGroup,
    created_at: Instant,
    loaded: AtomicBool,
    disposed: AtomicBool,
    /// Bumped on every scheduled persistence
    revision: AtomicU64,
    /// Highest revision written to the durable store
    persisted_revision: AtomicU64,
    last_persisted: Mutex<Option<Instant>>,
    wiring: Mutex<Option<Wiring>>,
    pub(crate) persist_timer: DebounceTimer,
    pub(crate) destroy_timer: DebounceTimer,
    /// At most one reconciliation per session at a time
    pub(crate) reconcile_lock: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(map_id: &str, config: &SyncConfig) -> Result<Self, DocError> {
        Ok(Self {
            map_id: map_id.to_string(),
            room_name: config.room_name(map_id),
            doc: MindMapDoc::new()?,
            awareness: Mutex::new(AwarenessRegistry::new(config.awareness_timeout())),
            clients: Mutex::new(HashMap::new()),
            fanout: BroadcastGroup::new(config.broadcast_capacity),
            created_at: Instant::now(),
            loaded: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            revision: AtomicU64::new(0),
            persisted_revision: AtomicU64::new(0),
            last_persisted: Mutex::new(None),
            wiring: Mutex::new(None),
            persist_timer: DebounceTimer::new(),
            destroy_timer: DebounceTimer::new(),
            reconcile_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn map_id(&self) -> &str {
        &self.map_id
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    pub fn doc(&self) -> &MindMapDoc {
        &self.doc
    }

    pub fn fanout(&self) -> &BroadcastGroup {
        &self.fanout
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    // ─── Clients ─────────────────────────────────────────────────────

    /// Register a connection and hand it the room's fan-out receiver.
    pub fn add_client(&self, connection: ConnectionId) -> broadcast::Receiver<RoomFrame> {
        let rx = self.fanout.subscribe();
        self.clients.lock().insert(
            connection,
            ClientInfo {
                joined_at: Instant::now(),
            },
        );
        rx
    }

    /// Returns the number of clients still attached.
    pub fn remove_client(&self, connection: ConnectionId) -> usize {
        let mut clients = self.clients.lock();
        if let Some(info) = clients.remove(&connection) {
            log::debug!(
                "Connection {connection} left {} after {:?}",
                self.room_name,
                info.joined_at.elapsed()
            );
        }
        clients.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn has_client(&self, connection: ConnectionId) -> bool {
        self.clients.lock().contains_key(&connection)
    }

    // ─── Document ────────────────────────────────────────────────────

    /// Apply an update that arrived through the relay. Fan-out to local
    /// clients happens in the document observer.
    pub fn apply_remote(&self, update: &[u8]) -> Result<(), DocError> {
        self.doc.apply_update(update, UpdateOrigin::Remote)
    }

    // ─── Awareness ───────────────────────────────────────────────────

    pub fn awareness(&self) -> MutexGuard<'_, AwarenessRegistry> {
        self.awareness.lock()
    }

    /// Merge a client's awareness update and relay the accepted entries to
    /// every connection, the sender included.
    pub fn apply_awareness(
        &self,
        payload: &[u8],
        connection: ConnectionId,
    ) -> Result<AwarenessChange, AwarenessError> {
        let (change, encoded) = {
            let mut awareness = self.awareness.lock();
            let change = awareness.apply_update(payload, Some(connection))?;
            let encoded = (!change.is_empty()).then(|| awareness.encode_update(&change.changed()));
            (change, encoded)
        };
        if let Some(encoded) = encoded {
            self.fanout.broadcast(Frame::Awareness(encoded).encode(), None);
        }
        Ok(change)
    }

    /// Clear the awareness entries a connection last renewed and tell the
    /// rest of the room.
    pub fn remove_awareness_of(&self, connection: ConnectionId) -> Vec<u64> {
        let (removed, encoded) = {
            let mut awareness = self.awareness.lock();
            let removed = awareness.remove_owned_by(connection);
            let encoded = awareness.encode_update(&removed);
            (removed, encoded)
        };
        if !removed.is_empty() {
            self.fanout.broadcast(Frame::Awareness(encoded).encode(), None);
        }
        removed
    }

    /// Drop awareness entries that went quiet.
    pub fn prune_awareness(&self, now: Instant) -> Vec<u64> {
        let (removed, encoded) = {
            let mut awareness = self.awareness.lock();
            let removed = awareness.prune_idle(now);
            let encoded = awareness.encode_update(&removed);
            (removed, encoded)
        };
        if !removed.is_empty() {
            log::debug!("Pruned {} idle awareness entries in {}", removed.len(), self.room_name);
            self.fanout.broadcast(Frame::Awareness(encoded).encode(), None);
        }
        removed
    }

    // ─── Lifecycle ───────────────────────────────────────────────────

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub(crate) fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
    }

    pub(crate) fn set_wiring(&self, observer: UpdateSubscription, relay: Option<RelaySubscription>) {
        *self.wiring.lock() = Some(Wiring {
            _observer: observer,
            _relay: relay,
        });
    }

    pub fn is_subscribed(&self) -> bool {
        self.wiring.lock().is_some()
    }

    /// Release the observer, the relay subscription and both timers.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.persist_timer.cancel();
        self.destroy_timer.cancel();
        let wiring = self.wiring.lock().take();
        drop(wiring);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Whether the session is counting down to its destruction.
    pub fn destroy_timer_armed(&self) -> bool {
        self.destroy_timer.is_armed()
    }

    /// Whether a reconciliation is waiting on the debounce.
    pub fn persist_timer_armed(&self) -> bool {
        self.persist_timer.is_armed()
    }

    // ─── Persistence bookkeeping ─────────────────────────────────────

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub(crate) fn bump_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Whether changes exist that the durable store has not seen.
    pub fn is_dirty(&self) -> bool {
        self.revision.load(Ordering::Acquire) > self.persisted_revision.load(Ordering::Acquire)
    }

    pub(crate) fn mark_persisted(&self, revision: u64) {
        self.persisted_revision.fetch_max(revision, Ordering::AcqRel);
        *self.last_persisted.lock() = Some(Instant::now());
    }

    pub fn last_persisted(&self) -> Option<Instant> {
        *self.last_persisted.lock()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("map_id", &self.map_id)
            .field("room_name", &self.room_name)
            .field("clients", &self.client_count())
            .field("revision", &self.revision())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
