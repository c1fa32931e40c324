//! Process-wide registry of live sessions, keyed by map id.
//!
//! ```text
//! join(map) ──► read lock hit ──► attach client, cancel destroy timer
//!          └──► miss ──► write lock ──► re-check ──► build:
//!                 1. persisted + pending snapshots from the cache
//!                 2. else rows from the durable store (cached as persisted)
//!                 3. observer: relay publish, fan-out, schedule persistence
//!                 4. relay subscription
//!
//! leave(last client) ──► destroy timer (grace) ──► flush if dirty, dispose
//! ```
//!
//! At most one session exists per map; a join during the grace period
//! reuses the live session without reloading anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use crate::broadcast::RoomFrame;
use crate::cache::SnapshotCache;
use crate::config::SyncConfig;
use crate::document::{ConnectionId, DocError, UpdateOrigin};
use crate::persistence::PersistenceCoordinator;
use crate::protocol::Frame;
use crate::relay::Relay;
use crate::session::Session;
use crate::store::{DurableStore, StoreError};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid map id: {0:?}")]
    InvalidMapId(String),
    #[error("Failed to load map {map_id}: {source}")]
    Load {
        map_id: String,
        #[source]
        source: StoreError,
    },
    #[error("Document error: {0}")]
    Document(#[from] DocError),
}

/// Where a new session's initial state came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    PersistedSnapshot,
    PendingSnapshot,
    PersistedAndPending,
    DurableStore,
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub sessions_created: u64,
    pub sessions_destroyed: u64,
}

pub struct SessionRegistry {
    config: Arc<SyncConfig>,
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn SnapshotCache>,
    relay: Arc<Relay>,
    persistence: Arc<PersistenceCoordinator>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl SessionRegistry {
    pub fn new(
        config: Arc<SyncConfig>,
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn SnapshotCache>,
        relay: Arc<Relay>,
    ) -> Arc<Self> {
        let persistence = Arc::new(PersistenceCoordinator::new(
            store.clone(),
            cache.clone(),
            config.clone(),
        ));
        Arc::new(Self {
            config,
            store,
            cache,
            relay,
            persistence,
            sessions: RwLock::new(HashMap::new()),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &Arc<SyncConfig> {
        &self.config
    }

    pub fn persistence(&self) -> &Arc<PersistenceCoordinator> {
        &self.persistence
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Attach `connection` to the map's session, creating it if needed.
    pub async fn join(
        self: &Arc<Self>,
        map_id: &str,
        connection: ConnectionId,
    ) -> Result<(Arc<Session>, broadcast::Receiver<RoomFrame>), SessionError> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(map_id) {
                // Attached under the lock so a destroy cannot slip in between
                let rx = session.add_client(connection);
                if session.destroy_timer.cancel() {
                    log::info!("Reusing {} within its grace period", session.room_name());
                }
                return Ok((session.clone(), rx));
            }
        }

        let mut sessions = self.sessions.write().await;
        let session = match sessions.get(map_id) {
            Some(session) => session.clone(),
            None => {
                let session = self.build_session(map_id)?;
                sessions.insert(map_id.to_string(), session.clone());
                session
            }
        };
        let rx = session.add_client(connection);
        session.destroy_timer.cancel();
        Ok((session, rx))
    }

    /// Get the map's session, creating it without attaching a client.
    pub async fn get_or_create(self: &Arc<Self>, map_id: &str) -> Result<Arc<Session>, SessionError> {
        if let Some(session) = self.sessions.read().await.get(map_id) {
            return Ok(session.clone());
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(map_id) {
            return Ok(session.clone());
        }
        let session = self.build_session(map_id)?;
        sessions.insert(map_id.to_string(), session.clone());
        Ok(session)
    }

    /// Detach `connection`. When the last client leaves the session is
    /// destroyed after the grace period unless someone rejoins first.
    pub fn leave(self: &Arc<Self>, session: &Arc<Session>, connection: ConnectionId) {
        if session.remove_client(connection) > 0 || session.is_disposed() {
            return;
        }

        let registry = Arc::downgrade(self);
        let target = Arc::downgrade(session);
        let map_id = session.map_id().to_string();
        session.destroy_timer.reset(self.config.room_grace(), async move {
            if let Some(registry) = registry.upgrade() {
                registry.destroy_if_idle(&map_id, &target).await;
            }
        });
        log::debug!(
            "{} is empty, destroying in {:?}",
            session.room_name(),
            self.config.room_grace()
        );
    }

    /// The write lock is held through the final flush so a concurrent join
    /// waits for it and then loads the flushed state into a fresh session.
    async fn destroy_if_idle(&self, map_id: &str, target: &Weak<Session>) {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions
            .get(map_id)
            .filter(|live| Arc::as_ptr(live) == target.as_ptr() && live.client_count() == 0)
            .cloned()
        else {
            return;
        };
        self.teardown(&session).await;
        sessions.remove(map_id);
        drop(sessions);
        log::info!("Destroyed {}", session.room_name());
    }

    async fn teardown(&self, session: &Arc<Session>) {
        if let Err(e) = self.persistence.fire_now(session).await {
            log::warn!(
                "Final flush of map {} failed, pending snapshot retained: {e}",
                session.map_id()
            );
        }
        self.persistence.untrack(session);
        session.dispose();
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    fn build_session(self: &Arc<Self>, map_id: &str) -> Result<Arc<Session>, SessionError> {
        if map_id.is_empty() {
            return Err(SessionError::InvalidMapId(map_id.to_string()));
        }

        let session = Arc::new(Session::new(map_id, &self.config)?);
        let source = self.load(&session)?;
        self.wire(&session);
        session.mark_loaded();
        self.created.fetch_add(1, Ordering::Relaxed);

        // Unreconciled edits from a previous session: put them on the timer
        if matches!(
            source,
            LoadSource::PendingSnapshot | LoadSource::PersistedAndPending
        ) {
            self.persistence.schedule(&session);
        }

        log::info!("Created {} ({source:?})", session.room_name());
        Ok(session)
    }

    /// Fill the session's document before any observer is attached.
    fn load(&self, session: &Session) -> Result<LoadSource, SessionError> {
        let map_id = session.map_id();
        let persisted = self.apply_cached(session, &self.config.state_key(map_id));
        let pending = self.apply_cached(session, &self.config.pending_key(map_id));

        match (persisted, pending) {
            (true, true) => return Ok(LoadSource::PersistedAndPending),
            (true, false) => return Ok(LoadSource::PersistedSnapshot),
            (false, true) => return Ok(LoadSource::PendingSnapshot),
            (false, false) => {}
        }

        let load_err = |source| SessionError::Load {
            map_id: map_id.to_string(),
            source,
        };
        let nodes = self.store.list_nodes(map_id).map_err(load_err)?;
        let connections = self.store.list_connections(map_id).map_err(load_err)?;
        if nodes.is_empty() && connections.is_empty() {
            return Ok(LoadSource::Empty);
        }

        session
            .doc()
            .populate(&nodes, &connections, UpdateOrigin::Local)?;
        let state = session.doc().encode_state();
        if let Err(e) = self.cache.set(&self.config.state_key(map_id), &state, None) {
            log::warn!("Failed to cache loaded state of map {map_id}: {e}");
        }
        Ok(LoadSource::DurableStore)
    }

    /// Merge a cached snapshot into the document. Returns whether one was
    /// applied; unreadable snapshots are logged and skipped.
    fn apply_cached(&self, session: &Session, key: &str) -> bool {
        let bytes = match self.cache.get(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return false,
            Err(e) => {
                log::warn!("Failed to read snapshot {key}: {e}");
                return false;
            }
        };
        match session.doc().apply_update(&bytes, UpdateOrigin::Local) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Discarding unreadable snapshot {key}: {e}");
                false
            }
        }
    }

    fn wire(&self, session: &Arc<Session>) {
        let weak = Arc::downgrade(session);
        let relay = self.relay.clone();
        let persistence = self.persistence.clone();

        let observer = session.doc().observe(move |update, origin| {
            let Some(session) = weak.upgrade() else {
                return;
            };
            if origin != UpdateOrigin::Remote {
                // Logged inside; relay trouble never fails an edit
                let _ = relay.publish(&session, update);
            }
            let exclude = match origin {
                UpdateOrigin::Connection(connection) => Some(connection),
                UpdateOrigin::Local | UpdateOrigin::Remote => None,
            };
            session
                .fanout()
                .broadcast(Frame::Update(update.to_vec()).encode(), exclude);
            persistence.schedule(&session);
        });

        let relay_subscription = match self.relay.attach(session) {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                log::warn!("{} runs without relay: {e}", session.room_name());
                None
            }
        };
        session.set_wiring(observer, relay_subscription);
    }

    pub async fn session(&self, map_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(map_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Prune idle awareness entries in every session.
    pub async fn sweep_awareness(&self) -> usize {
        let now = tokio::time::Instant::now();
        self.sessions()
            .await
            .iter()
            .map(|session| session.prune_awareness(now).len())
            .sum()
    }

    /// Flush every dirty session, then tear all sessions down.
    pub async fn shutdown(&self) {
        let summary = self.persistence.flush_all().await;
        let mut sessions = self.sessions.write().await;
        let closing: Vec<Arc<Session>> = sessions.drain().map(|(_, session)| session).collect();
        for session in &closing {
            self.teardown(session).await;
        }
        drop(sessions);
        log::info!(
            "Registry shut down: {} sessions closed, {} flushed, {} flush failures",
            closing.len(),
            summary.flushed,
            summary.failed
        );
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_sessions: self.session_count().await,
            sessions_created: self.created.load(Ordering::Relaxed),
            sessions_destroyed: self.destroyed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::MemoryCache;
    use crate::model::NodeRecord;
    use crate::relay::LocalBus;
    use crate::store::MemoryStore;

    fn registry_with(store: Arc<MemoryStore>, cache: Arc<MemoryCache>) -> Arc<SessionRegistry> {
        registry_configured(SyncConfig::for_testing(), store, cache)
    }

    fn registry_configured(
        config: SyncConfig,
        store: Arc<MemoryStore>,
        cache: Arc<MemoryCache>,
    ) -> Arc<SessionRegistry> {
        let config = Arc::new(config);
        let relay = Arc::new(Relay::new(Arc::new(LocalBus::new()), config.clone()));
        SessionRegistry::new(config, store, cache, relay)
    }

    #[tokio::test]
    async fn test_join_creates_one_session_per_map() {
        let registry = registry_with(Arc::new(MemoryStore::new()), Arc::new(MemoryCache::new()));

        let (a, _rx_a) = registry.join("m1", ConnectionId::new()).await.unwrap();
        let (b, _rx_b) = registry.join("m1", ConnectionId::new()).await.unwrap();
        let (c, _rx_c) = registry.join("m2", ConnectionId::new()).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.client_count(), 2);
        assert!(a.is_loaded());
        assert!(a.is_subscribed());
        assert_eq!(registry.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_joins_share_session() {
        let registry = registry_with(Arc::new(MemoryStore::new()), Arc::new(MemoryCache::new()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.join("m1", ConnectionId::new()).await.unwrap().0
            }));
        }
        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap());
        }

        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(sessions[0].client_count(), 8);
        assert_eq!(registry.stats().await.sessions_created, 1);
    }

    #[tokio::test]
    async fn test_load_from_store_caches_persisted_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let mut txn = store.begin("m1").unwrap();
        txn.create_nodes(&[NodeRecord::new("a", "Root")]).unwrap();
        txn.commit().unwrap();
        let cache = Arc::new(MemoryCache::new());
        let registry = registry_with(store, cache.clone());

        let session = registry.get_or_create("m1").await.unwrap();
        assert_eq!(session.doc().node("a").unwrap().text, "Root");
        assert!(cache.get("yjs:state:m1").unwrap().is_some());
        // Loading is not a change
        assert!(!session.is_dirty());
    }

    #[tokio::test]
    async fn test_load_merges_persisted_and_pending() {
        let cache = Arc::new(MemoryCache::new());
        let persisted = crate::document::MindMapDoc::new().unwrap();
        persisted
            .upsert_node(&NodeRecord::new("a", "A"), UpdateOrigin::Local)
            .unwrap();
        let pending = crate::document::MindMapDoc::new().unwrap();
        pending
            .upsert_node(&NodeRecord::new("b", "B"), UpdateOrigin::Local)
            .unwrap();
        cache.set("yjs:state:m1", &persisted.encode_state(), None).unwrap();
        cache.set("yjs:pending:m1", &pending.encode_state(), None).unwrap();

        let registry = registry_with(Arc::new(MemoryStore::new()), cache);
        let session = registry.get_or_create("m1").await.unwrap();

        assert_eq!(session.doc().nodes().len(), 2);
        // Recovered edits are queued for reconciliation
        assert!(session.is_dirty());
        assert!(session.persist_timer.is_armed());
    }

    #[tokio::test]
    async fn test_local_edit_schedules_persistence() {
        let cache = Arc::new(MemoryCache::new());
        let registry = registry_with(Arc::new(MemoryStore::new()), cache.clone());
        let (session, mut rx) = registry.join("m1", ConnectionId::new()).await.unwrap();

        session
            .doc()
            .upsert_node(&NodeRecord::new("a", "A"), UpdateOrigin::Local)
            .unwrap();

        assert!(session.is_dirty());
        assert!(cache.get("yjs:pending:m1").unwrap().is_some());
        // Server-originated updates reach every client
        let frame = rx.try_recv().unwrap();
        assert!(frame.exclude.is_none());
    }

    #[tokio::test]
    async fn test_empty_map_id_rejected() {
        let registry = registry_with(Arc::new(MemoryStore::new()), Arc::new(MemoryCache::new()));
        assert!(matches!(
            registry.get_or_create("").await,
            Err(SessionError::InvalidMapId(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_during_final_flush_waits_for_teardown() {
        // Grace shorter than the debounce: the session is still dirty when destroyed
        let config = SyncConfig {
            room_grace_ms: 500,
            debounce_ms: 2_000,
            ..SyncConfig::for_testing()
        };
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let registry = registry_configured(config, store.clone(), cache.clone());

        let conn = ConnectionId::new();
        let (old, _rx) = registry.join("m1", conn).await.unwrap();
        old.doc()
            .upsert_node(&NodeRecord::new("a", "A"), UpdateOrigin::Connection(conn))
            .unwrap();
        registry.leave(&old, conn);

        // Stall the final flush
        let stalled = old.reconcile_lock.lock().await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(old.is_dirty());

        let joining = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let conn = ConnectionId::new();
                let (session, _rx) = registry.join("m1", conn).await.unwrap();
                session
                    .doc()
                    .upsert_node(&NodeRecord::new("b", "B"), UpdateOrigin::Connection(conn))
                    .unwrap();
                session
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!joining.is_finished());

        drop(stalled);
        let fresh = joining.await.unwrap();

        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(old.is_disposed());
        assert_eq!(fresh.doc().node("a").unwrap().text, "A");
        assert_eq!(store.list_nodes("m1").unwrap().len(), 1);
        // The old flush ran before the new edit, so its snapshot is intact
        assert!(fresh.is_dirty());
        assert!(cache.get("yjs:pending:m1").unwrap().is_some());
        assert_eq!(registry.stats().await.sessions_destroyed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_follows_tokio_clock() {
        let registry = registry_with(Arc::new(MemoryStore::new()), Arc::new(MemoryCache::new()));
        let conn = ConnectionId::new();
        let (session, _rx) = registry.join("m1", conn).await.unwrap();
        session
            .apply_awareness(&crate::awareness::encode_entries(&[(5, 1, Some("{}"))]), conn)
            .unwrap();

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(registry.sweep_awareness().await, 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(registry.sweep_awareness().await, 1);
        assert!(session.awareness().state(5).is_none());
    }
}

