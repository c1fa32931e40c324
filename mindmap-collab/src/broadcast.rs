//! Room fan-out to connected clients with backpressure.
//!
//! Uses one tokio broadcast channel per room for O(1) send to all
//! connections. Each connection holds an independent receiver buffering up
//! to `capacity` frames. A frame may name one connection to skip; the
//! receiving side does the filtering, so the sender never takes a lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::document::ConnectionId;

/// An encoded frame on its way to every connection in a room.
#[derive(Debug, Clone)]
pub struct RoomFrame {
    /// Connection that must not receive this frame (the one it came from)
    pub exclude: Option<ConnectionId>,
    pub bytes: Arc<Vec<u8>>,
}

impl RoomFrame {
    /// Whether `connection` should forward this frame to its socket.
    pub fn is_for(&self, connection: ConnectionId) -> bool {
        self.exclude != Some(connection)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub receivers: usize,
}

/// Fan-out channel for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RoomFrame>,
    capacity: usize,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a connection may fall behind before it
    /// starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomFrame> {
        self.sender.subscribe()
    }

    /// Send encoded bytes to every receiver. Returns the receiver count.
    pub fn broadcast(&self, bytes: Vec<u8>, exclude: Option<ConnectionId>) -> usize {
        self.broadcast_raw(RoomFrame {
            exclude,
            bytes: Arc::new(bytes),
        })
    }

    /// Send a prepared frame (zero-copy fast path).
    pub fn broadcast_raw(&self, frame: RoomFrame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_lagged(&self, skipped: u64) {
        self.frames_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }
}
