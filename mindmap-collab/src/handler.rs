//! Per-connection sync protocol state machine.
//!
//! ```text
//! Connecting ──greeting()──► Syncing ──step 2 received──► Synced
//!      │                        │                            │
//!      └────────────────────────┴─────── close() ────────────┴──► Closed
//! ```
//!
//! The handler is transport-agnostic: it turns inbound frames into reply
//! frames and filters the room fan-out for its connection. The server owns
//! the socket. Dropping a handler closes it.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::broadcast::RoomFrame;
use crate::document::{ConnectionId, UpdateOrigin};
use crate::protocol::{Frame, ProtocolError};
use crate::registry::{SessionError, SessionRegistry};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Syncing,
    Synced,
    Closed,
}

pub struct ConnectionHandler {
    id: ConnectionId,
    session: Arc<Session>,
    registry: Arc<SessionRegistry>,
    state: ConnState,
    max_frame_bytes: usize,
}

impl ConnectionHandler {
    /// Join the map's session as a new connection.
    pub async fn open(
        registry: &Arc<SessionRegistry>,
        map_id: &str,
    ) -> Result<(Self, broadcast::Receiver<RoomFrame>), SessionError> {
        let id = ConnectionId::new();
        let (session, rx) = registry.join(map_id, id).await?;
        log::debug!("Connection {id} opened on {}", session.room_name());

        let handler = Self {
            id,
            session,
            registry: registry.clone(),
            state: ConnState::Connecting,
            max_frame_bytes: registry.config().max_frame_bytes,
        };
        Ok((handler, rx))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Frames to send right after the connection opens: our state vector,
    /// then the room's current awareness.
    pub fn greeting(&mut self) -> Vec<Vec<u8>> {
        let mut frames = vec![Frame::SyncStep1(self.session.doc().state_vector()).encode()];
        if let Some(awareness) = self.session.awareness().encode_live() {
            frames.push(Frame::Awareness(awareness).encode());
        }
        if self.state == ConnState::Connecting {
            self.state = ConnState::Syncing;
        }
        frames
    }

    /// Process one inbound frame and return the replies for this connection.
    ///
    /// An error means the frame was rejected and the connection should be
    /// closed; nothing from a rejected frame reaches the document.
    pub fn handle_frame(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
        if self.state == ConnState::Closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        if bytes.len() > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                limit: self.max_frame_bytes,
            });
        }

        let frame = Frame::decode(bytes)?;
        log::trace!("Connection {} sent {}", self.id, frame.kind_name());
        let origin = UpdateOrigin::Connection(self.id);

        match frame {
            Frame::SyncStep1(state_vector) => {
                let diff = self.session.doc().diff_update(&state_vector)?;
                Ok(vec![Frame::SyncStep2(diff).encode()])
            }
            Frame::SyncStep2(update) => {
                self.session.doc().apply_update(&update, origin)?;
                if self.state != ConnState::Synced {
                    self.state = ConnState::Synced;
                    log::debug!("Connection {} synced with {}", self.id, self.session.room_name());
                }
                Ok(Vec::new())
            }
            Frame::Update(update) => {
                self.session.doc().apply_update(&update, origin)?;
                Ok(Vec::new())
            }
            Frame::Awareness(payload) => {
                self.session.apply_awareness(&payload, self.id)?;
                Ok(Vec::new())
            }
        }
    }

    /// Bytes to forward from the room fan-out, or `None` if the frame
    /// originated from this connection.
    pub fn forward(&self, frame: &RoomFrame) -> Option<Arc<Vec<u8>>> {
        if self.state == ConnState::Closed || !frame.is_for(self.id) {
            return None;
        }
        Some(frame.bytes.clone())
    }

    /// Full document state, sent after this connection lagged behind the
    /// fan-out and lost frames.
    pub fn resync(&self) -> Vec<u8> {
        Frame::Update(self.session.doc().encode_state()).encode()
    }

    /// Leave the session. Idempotent.
    pub fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closed;
        let removed = self.session.remove_awareness_of(self.id);
        if !removed.is_empty() {
            log::debug!("Connection {} cleared {} awareness entries", self.id, removed.len());
        }
        self.registry.leave(&self.session, self.id);
        log::debug!("Connection {} closed on {}", self.id, self.session.room_name());
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::encode_entries;
    use crate::cache::MemoryCache;
    use crate::config::SyncConfig;
    use crate::document::MindMapDoc;
    use crate::model::NodeRecord;
    use crate::relay::{LocalBus, Relay};
    use crate::store::MemoryStore;

    fn registry() -> Arc<SessionRegistry> {
        let config = Arc::new(SyncConfig::for_testing());
        let relay = Arc::new(Relay::new(Arc::new(LocalBus::new()), config.clone()));
        SessionRegistry::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCache::new()),
            relay,
        )
    }

    fn update_with(node: NodeRecord) -> Vec<u8> {
        let doc = MindMapDoc::new().unwrap();
        doc.upsert_node(&node, UpdateOrigin::Local).unwrap();
        doc.encode_state()
    }

    #[tokio::test]
    async fn test_handshake() {
        let registry = registry();
        let (mut handler, _rx) = ConnectionHandler::open(&registry, "m1").await.unwrap();
        assert_eq!(handler.state(), ConnState::Connecting);

        let greeting = handler.greeting();
        assert_eq!(greeting.len(), 1);
        assert!(matches!(Frame::decode(&greeting[0]).unwrap(), Frame::SyncStep1(_)));
        assert_eq!(handler.state(), ConnState::Syncing);

        // Client asks for everything it is missing
        let client = MindMapDoc::new().unwrap();
        let replies = handler
            .handle_frame(&Frame::SyncStep1(client.state_vector()).encode())
            .unwrap();
        assert!(matches!(Frame::decode(&replies[0]).unwrap(), Frame::SyncStep2(_)));

        // Client answers the server's step 1
        let replies = handler
            .handle_frame(&Frame::SyncStep2(update_with(NodeRecord::new("a", "A"))).encode())
            .unwrap();
        assert!(replies.is_empty());
        assert_eq!(handler.state(), ConnState::Synced);
        assert_eq!(handler.session().doc().node("a").unwrap().text, "A");
    }

    #[tokio::test]
    async fn test_update_not_echoed_to_sender() {
        let registry = registry();
        let (mut sender, mut sender_rx) = ConnectionHandler::open(&registry, "m1").await.unwrap();
        let (receiver, mut receiver_rx) = ConnectionHandler::open(&registry, "m1").await.unwrap();

        sender
            .handle_frame(&Frame::Update(update_with(NodeRecord::new("a", "A"))).encode())
            .unwrap();

        let frame = sender_rx.try_recv().unwrap();
        assert!(sender.forward(&frame).is_none());

        let frame = receiver_rx.try_recv().unwrap();
        let bytes = receiver.forward(&frame).unwrap();
        assert!(matches!(Frame::decode(&bytes).unwrap(), Frame::Update(_)));
    }

    #[tokio::test]
    async fn test_malformed_frame_rejected() {
        let registry = registry();
        let (mut handler, _rx) = ConnectionHandler::open(&registry, "m1").await.unwrap();

        assert!(handler.handle_frame(&[7]).is_err());
        assert!(handler
            .handle_frame(&Frame::Update(vec![0xff, 0xff]).encode())
            .is_err());
        assert!(handler.session().doc().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let config = Arc::new(SyncConfig {
            max_frame_bytes: 8,
            ..SyncConfig::for_testing()
        });
        let relay = Arc::new(Relay::new(Arc::new(LocalBus::new()), config.clone()));
        let registry = SessionRegistry::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCache::new()),
            relay,
        );
        let (mut handler, _rx) = ConnectionHandler::open(&registry, "m1").await.unwrap();

        assert!(matches!(
            handler.handle_frame(&[0u8; 9]),
            Err(ProtocolError::FrameTooLarge { size: 9, limit: 8 })
        ));
    }

    #[tokio::test]
    async fn test_greeting_includes_awareness() {
        let registry = registry();
        let (mut first, _rx) = ConnectionHandler::open(&registry, "m1").await.unwrap();
        first
            .handle_frame(&Frame::Awareness(encode_entries(&[(9, 1, Some("{}"))])).encode())
            .unwrap();

        let (mut second, _rx2) = ConnectionHandler::open(&registry, "m1").await.unwrap();
        let greeting = second.greeting();
        assert_eq!(greeting.len(), 2);
        assert!(matches!(Frame::decode(&greeting[1]).unwrap(), Frame::Awareness(_)));
    }

    #[tokio::test]
    async fn test_close_clears_awareness_and_leaves() {
        let registry = registry();
        let (mut handler, _rx) = ConnectionHandler::open(&registry, "m1").await.unwrap();
        let (_other, mut other_rx) = ConnectionHandler::open(&registry, "m1").await.unwrap();
        handler
            .handle_frame(&Frame::Awareness(encode_entries(&[(9, 1, Some("{}"))])).encode())
            .unwrap();
        let _ = other_rx.try_recv();

        let session = handler.session().clone();
        handler.close();
        handler.close();

        assert_eq!(handler.state(), ConnState::Closed);
        assert_eq!(session.client_count(), 1);
        assert!(session.awareness().state(9).is_none());
        assert!(other_rx.try_recv().is_ok());
        assert!(matches!(
            handler.handle_frame(&[0, 0, 1, 0]),
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_reconnected_client_presence_follows_new_socket() {
        let registry = registry();
        let (_watcher, _rx) = ConnectionHandler::open(&registry, "m1").await.unwrap();
        let (mut stale, _rx_stale) = ConnectionHandler::open(&registry, "m1").await.unwrap();
        let session = stale.session().clone();
        stale
            .handle_frame(&Frame::Awareness(encode_entries(&[(42, 1, Some("{}"))])).encode())
            .unwrap();

        // Same client id comes back on a new socket before the old one closes
        let (mut fresh, _rx_fresh) = ConnectionHandler::open(&registry, "m1").await.unwrap();
        fresh
            .handle_frame(
                &Frame::Awareness(encode_entries(&[(42, 5, Some(r#"{"x":1}"#))])).encode(),
            )
            .unwrap();

        stale.close();
        assert_eq!(session.awareness().state(42), Some(r#"{"x":1}"#));

        fresh.close();
        assert!(session.awareness().state(42).is_none());
        assert_eq!(session.awareness().live_count(), 0);
    }
}
