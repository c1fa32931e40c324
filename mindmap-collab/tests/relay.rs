//! Cross-instance relay tests. Two registries on one `LocalBus` stand in
//! for two server instances behind a shared broker.

use std::sync::Arc;
use std::time::Duration;

use mindmap_collab::{
    ConnectionId, DurableStore, Frame, LocalBus, MemoryCache, MemoryStore, MindMapDoc, NodeRecord,
    Relay, RelayError, RelayTransport, Session, SessionRegistry, SyncConfig, UpdateOrigin,
};
use tokio::sync::broadcast;

fn instance(bus: &Arc<LocalBus>) -> Arc<SessionRegistry> {
    let config = Arc::new(SyncConfig::for_testing());
    let relay = Arc::new(Relay::new(bus.clone(), config.clone()));
    SessionRegistry::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryCache::new()),
        relay,
    )
}

/// Transport whose broker refuses every publish. Subscriptions still work.
#[derive(Default)]
struct FailingTransport {
    inner: LocalBus,
}

impl RelayTransport for FailingTransport {
    fn publish(&self, _channel: &str, _payload: Vec<u8>) -> Result<(), RelayError> {
        Err(RelayError::Transport("broker unreachable".to_string()))
    }

    fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Arc<Vec<u8>>>, RelayError> {
        self.inner.subscribe(channel)
    }

    fn unsubscribe(&self, channel: &str) {
        self.inner.unsubscribe(channel)
    }
}

fn update_with(node: NodeRecord) -> Vec<u8> {
    let doc = MindMapDoc::new().unwrap();
    doc.upsert_node(&node, UpdateOrigin::Local).unwrap();
    doc.encode_state()
}

async fn wait_for_node(session: &Session, id: &str) {
    for _ in 0..200 {
        if session.doc().node(id).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("node {id} never reached {}", session.room_name());
}

#[tokio::test]
async fn test_update_reaches_other_instance_once() {
    let bus = Arc::new(LocalBus::new());
    let a = instance(&bus);
    let b = instance(&bus);

    let writer = ConnectionId::new();
    let reader = ConnectionId::new();
    let (session_a, _rx_a) = a.join("m1", writer).await.unwrap();
    let (session_b, mut rx_b) = b.join("m1", reader).await.unwrap();

    session_a
        .doc()
        .apply_update(
            &update_with(NodeRecord::new("n1", "From A")),
            UpdateOrigin::Connection(writer),
        )
        .unwrap();

    wait_for_node(&session_b, "n1").await;
    assert_eq!(session_b.doc().node("n1").unwrap().text, "From A");

    // B's clients get the update
    let frame = rx_b.recv().await.unwrap();
    assert!(frame.is_for(reader));
    assert!(matches!(Frame::decode(&frame.bytes).unwrap(), Frame::Update(_)));

    // Let any echo play out, then count: one publish, no bounce back
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bus.published(), 1);
    assert_eq!(a.relay().stats().published, 1);
    assert_eq!(a.relay().stats().received, 0);
    assert_eq!(b.relay().stats().applied, 1);
    assert_eq!(b.relay().stats().published, 0);
}

#[tokio::test]
async fn test_both_instances_converge() {
    let bus = Arc::new(LocalBus::new());
    let a = instance(&bus);
    let b = instance(&bus);
    let session_a = a.get_or_create("m1").await.unwrap();
    let session_b = b.get_or_create("m1").await.unwrap();

    session_a
        .doc()
        .upsert_node(&NodeRecord::new("x", "X"), UpdateOrigin::Local)
        .unwrap();
    session_b
        .doc()
        .upsert_node(&NodeRecord::new("y", "Y"), UpdateOrigin::Local)
        .unwrap();

    wait_for_node(&session_a, "y").await;
    wait_for_node(&session_b, "x").await;
    assert_eq!(session_a.doc().nodes(), session_b.doc().nodes());
}

#[tokio::test]
async fn test_maps_do_not_cross() {
    let bus = Arc::new(LocalBus::new());
    let a = instance(&bus);
    let b = instance(&bus);
    let session_a = a.get_or_create("m1").await.unwrap();
    let other = b.get_or_create("m2").await.unwrap();

    session_a
        .doc()
        .upsert_node(&NodeRecord::new("x", "X"), UpdateOrigin::Local)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(other.doc().is_empty());
    assert_eq!(b.relay().stats().received, 0);
}

#[tokio::test]
async fn test_disposed_session_stops_listening() {
    let bus = Arc::new(LocalBus::new());
    let a = instance(&bus);
    let b = instance(&bus);
    let session_a = a.get_or_create("m1").await.unwrap();
    let session_b = b.get_or_create("m1").await.unwrap();

    session_b.dispose();
    session_a
        .doc()
        .upsert_node(&NodeRecord::new("x", "X"), UpdateOrigin::Local)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(session_b.doc().is_empty());
    assert_eq!(bus.subscriber_count("yjs:updates:mindmap-m1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_publish_failure_does_not_fail_edit() {
    let config = Arc::new(SyncConfig::for_testing());
    let relay = Arc::new(Relay::new(Arc::new(FailingTransport::default()), config.clone()));
    let store = Arc::new(MemoryStore::new());
    let registry = SessionRegistry::new(config, store.clone(), Arc::new(MemoryCache::new()), relay);

    let writer = ConnectionId::new();
    let reader = ConnectionId::new();
    let (session, _writer_rx) = registry.join("m1", writer).await.unwrap();
    let (_, mut reader_rx) = registry.join("m1", reader).await.unwrap();

    session
        .doc()
        .apply_update(
            &update_with(NodeRecord::new("n1", "Local only")),
            UpdateOrigin::Connection(writer),
        )
        .unwrap();

    // Local clients still get the update and persistence is still scheduled
    let frame = reader_rx.try_recv().unwrap();
    assert!(frame.is_for(reader));
    assert!(matches!(Frame::decode(&frame.bytes).unwrap(), Frame::Update(_)));
    assert!(session.persist_timer_armed());
    assert_eq!(registry.relay().stats().publish_failures, 1);
    assert_eq!(registry.relay().stats().published, 0);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(store.list_nodes("m1").unwrap().len(), 1);
}

