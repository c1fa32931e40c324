//! Persistence integration tests: debouncing, crash recovery, failure
//! handling and row-level reconciliation against the durable store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mindmap_collab::store::StoreTxn;
use mindmap_collab::{
    CacheError, ConnectionId, ConnectionRecord, DurableStore, Frame, LocalBus, MemoryCache,
    MemoryStore, NodeRecord, Relay, SessionRegistry, SnapshotCache, StoreError, SyncConfig,
    UpdateOrigin,
};

fn registry(store: Arc<dyn DurableStore>, cache: Arc<dyn SnapshotCache>) -> Arc<SessionRegistry> {
    let config = Arc::new(SyncConfig::for_testing());
    let relay = Arc::new(Relay::new(Arc::new(LocalBus::new()), config.clone()));
    SessionRegistry::new(config, store, cache, relay)
}

/// Durable store that can be switched into refusing transactions.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    down: AtomicBool,
}

impl DurableStore for FlakyStore {
    fn list_nodes(&self, map_id: &str) -> Result<Vec<NodeRecord>, StoreError> {
        self.inner.list_nodes(map_id)
    }

    fn list_connections(&self, map_id: &str) -> Result<Vec<ConnectionRecord>, StoreError> {
        self.inner.list_connections(map_id)
    }

    fn begin<'a>(&'a self, map_id: &str) -> Result<Box<dyn StoreTxn + 'a>, StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Database("connection refused".to_string()));
        }
        self.inner.begin(map_id)
    }
}

/// Snapshot cache whose reads and writes can be made to fail.
#[derive(Default)]
struct FailingCache {
    inner: MemoryCache,
    reads_fail: AtomicBool,
    writes_fail: AtomicBool,
}

impl FailingCache {
    fn unavailable() -> Self {
        let cache = Self::default();
        cache.reads_fail.store(true, Ordering::SeqCst);
        cache.writes_fail.store(true, Ordering::SeqCst);
        cache
    }

    fn refused() -> CacheError {
        CacheError::Backend("connection reset".to_string())
    }
}

impl SnapshotCache for FailingCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        if self.reads_fail.load(Ordering::SeqCst) {
            return Err(Self::refused());
        }
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        if self.writes_fail.load(Ordering::SeqCst) {
            return Err(Self::refused());
        }
        self.inner.set(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        if self.writes_fail.load(Ordering::SeqCst) {
            return Err(Self::refused());
        }
        self.inner.delete(key)
    }
}

#[tokio::test(start_paused = true)]
async fn test_edits_within_debounce_window_reconcile_once() {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    let registry = registry(store.clone(), cache.clone());
    let session = registry.get_or_create("m1").await.unwrap();

    for i in 0..5 {
        session
            .doc()
            .upsert_node(&NodeRecord::new(format!("n{i}"), "idea"), UpdateOrigin::Local)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    // Still inside the quiet period: only the pending snapshot exists
    assert_eq!(store.commit_count(), 0);
    assert!(cache.get("yjs:pending:m1").unwrap().is_some());
    assert!(session.is_dirty());

    tokio::time::sleep(Duration::from_millis(2000)).await;

    assert_eq!(store.commit_count(), 1);
    assert_eq!(store.list_nodes("m1").unwrap().len(), 5);
    assert!(cache.get("yjs:pending:m1").unwrap().is_none());
    assert!(cache.get("yjs:state:m1").unwrap().is_some());
    assert!(!session.is_dirty());
    assert!(session.last_persisted().is_some());
    assert_eq!(registry.persistence().stats().reconciliations, 1);
}

#[tokio::test(start_paused = true)]
async fn test_pending_snapshot_recovers_crash_inside_debounce() {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());

    {
        let registry = registry(store.clone(), cache.clone());
        let session = registry.get_or_create("m1").await.unwrap();
        session
            .doc()
            .upsert_node(&NodeRecord::new("a", "Unsaved idea"), UpdateOrigin::Local)
            .unwrap();
        // The process dies before the debounce fires
        session.dispose();
    }
    assert_eq!(store.commit_count(), 0);

    let registry = registry(store.clone(), cache.clone());
    let session = registry.get_or_create("m1").await.unwrap();
    assert_eq!(session.doc().node("a").unwrap().text, "Unsaved idea");

    // The recovered edit is reconciled on the normal schedule
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(store.list_nodes("m1").unwrap().len(), 1);
    assert!(cache.get("yjs:pending:m1").unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_store_failure_keeps_pending_snapshot() {
    let store = Arc::new(FlakyStore::default());
    store.down.store(true, Ordering::SeqCst);
    let cache = Arc::new(MemoryCache::new());
    let registry = registry(store.clone(), cache.clone());
    let session = registry.get_or_create("m1").await.unwrap();

    session
        .doc()
        .upsert_node(&NodeRecord::new("a", "A"), UpdateOrigin::Local)
        .unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(registry.persistence().stats().failures, 1);
    assert!(cache.get("yjs:pending:m1").unwrap().is_some());
    assert!(session.is_dirty());
    assert!(store.inner.list_nodes("m1").unwrap().is_empty());

    // The next change retries everything
    store.down.store(false, Ordering::SeqCst);
    session
        .doc()
        .upsert_node(&NodeRecord::new("b", "B"), UpdateOrigin::Local)
        .unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(store.inner.list_nodes("m1").unwrap().len(), 2);
    assert!(cache.get("yjs:pending:m1").unwrap().is_none());
    assert!(!session.is_dirty());
}

#[tokio::test]
async fn test_shutdown_flushes_dirty_sessions() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry(store.clone(), Arc::new(MemoryCache::new()));
    let first = registry.get_or_create("m1").await.unwrap();
    let second = registry.get_or_create("m2").await.unwrap();
    let _clean = registry.get_or_create("m3").await.unwrap();

    first
        .doc()
        .upsert_node(&NodeRecord::new("a", "A"), UpdateOrigin::Local)
        .unwrap();
    second
        .doc()
        .upsert_node(&NodeRecord::new("b", "B"), UpdateOrigin::Local)
        .unwrap();

    registry.shutdown().await;

    assert_eq!(store.list_nodes("m1").unwrap().len(), 1);
    assert_eq!(store.list_nodes("m2").unwrap().len(), 1);
    assert!(!store.map_exists("m3").unwrap());
    assert!(first.is_disposed());
    assert_eq!(registry.session_count().await, 0);
}

#[tokio::test]
async fn test_reconcile_writes_only_the_difference() {
    let store = Arc::new(MemoryStore::new());
    let mut txn = store.begin("m1").unwrap();
    txn.create_nodes(&[
        NodeRecord::new("a", "A"),
        NodeRecord::new("b", "B"),
        NodeRecord::new("c", "C"),
    ])
    .unwrap();
    txn.create_connections(&[
        ConnectionRecord::new("ab", "a", "b"),
        ConnectionRecord::new("bc", "b", "c"),
    ])
    .unwrap();
    txn.commit().unwrap();

    let registry = registry(store.clone(), Arc::new(MemoryCache::new()));
    let session = registry.get_or_create("m1").await.unwrap();
    let doc = session.doc();
    doc.remove_connection("ab", UpdateOrigin::Local).unwrap();
    doc.remove_node("a", UpdateOrigin::Local).unwrap();
    doc.upsert_node(&NodeRecord::new("c", "C'"), UpdateOrigin::Local)
        .unwrap();
    doc.upsert_node(&NodeRecord::new("d", "D"), UpdateOrigin::Local)
        .unwrap();
    doc.upsert_connection(
        &ConnectionRecord::new("bc", "b", "c").with_label("leads to"),
        UpdateOrigin::Local,
    )
    .unwrap();

    let report = registry
        .persistence()
        .fire_now(&session)
        .await
        .unwrap()
        .expect("session had changes");
    assert_eq!((report.created, report.updated, report.deleted), (1, 2, 2));

    assert_eq!(store.node_version("m1", "a").unwrap(), None);
    assert_eq!(store.node_version("m1", "b").unwrap(), Some(1));
    assert_eq!(store.node_version("m1", "c").unwrap(), Some(2));
    assert_eq!(store.node_version("m1", "d").unwrap(), Some(1));
    assert_eq!(store.connection_version("m1", "ab"), None);
    assert_eq!(store.connection_version("m1", "bc"), Some(2));

    // Nothing changed since: no second write
    let commits = store.commit_count();
    assert!(registry.persistence().fire_now(&session).await.unwrap().is_none());
    assert_eq!(store.commit_count(), commits);
}

#[tokio::test]
async fn test_unreadable_cache_falls_back_to_store() {
    let store = Arc::new(MemoryStore::new());
    let mut txn = store.begin("m1").unwrap();
    txn.create_nodes(&[NodeRecord::new("root", "Central idea")])
        .unwrap();
    txn.commit().unwrap();
    let cache = Arc::new(FailingCache::default());
    cache.reads_fail.store(true, Ordering::SeqCst);

    let registry = registry(store.clone(), cache.clone());
    let session = registry.get_or_create("m1").await.unwrap();

    assert_eq!(session.doc().node("root").unwrap().text, "Central idea");
    assert_eq!(store.load_count(), 1);
    assert!(!session.is_dirty());
    // The loaded state was still offered to the cache
    assert!(cache.inner.get("yjs:state:m1").unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_cache_outage_does_not_block_edits_or_reconciliation() {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(FailingCache::unavailable());
    let registry = registry(store.clone(), cache);

    let writer = ConnectionId::new();
    let (session, _writer_rx) = registry.join("m1", writer).await.unwrap();
    let (_, mut reader_rx) = registry.join("m1", ConnectionId::new()).await.unwrap();

    session
        .doc()
        .upsert_node(&NodeRecord::new("a", "A"), UpdateOrigin::Connection(writer))
        .unwrap();

    // The edit is applied and fanned out even though no pending snapshot exists
    assert_eq!(session.doc().node("a").unwrap().text, "A");
    let frame = reader_rx.try_recv().unwrap();
    assert!(matches!(Frame::decode(&frame.bytes).unwrap(), Frame::Update(_)));
    assert!(session.is_dirty());
    assert!(session.persist_timer_armed());

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(store.list_nodes("m1").unwrap().len(), 1);
    assert!(!session.is_dirty());
    assert_eq!(registry.persistence().stats().reconciliations, 1);
    assert_eq!(registry.persistence().stats().failures, 0);
}

