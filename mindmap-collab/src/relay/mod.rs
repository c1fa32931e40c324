//! Cross-instance update relay.
//!
//! ```text
//! Instance A                                   Instance B
//! ┌──────────┐  publish   ┌───────────────┐  deliver  ┌──────────┐
//! │ Session  │ ─────────► │ RelayTransport│ ────────► │ Session  │
//! │ observer │  envelope  │ channel per   │           │ listener │
//! └──────────┘            │ room          │           └────┬─────┘
//!                         └───────────────┘                │ apply (Remote)
//!                                                          ▼
//!                                                    local clients
//! ```
//!
//! Envelopes carry the publishing instance id; a listener drops envelopes
//! from its own instance. Updates applied from the relay are tagged
//! `Remote` and never published again, which is what keeps two instances
//! from bouncing an update between them forever.
//!
//! Relay failures are logged and never fail an edit: the pending snapshot
//! and the durable store still converge every instance on reload.

pub mod broker;
pub mod remote;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::session::Session;

pub use broker::RelayBroker;
pub use remote::RemoteBus;

/// Messages buffered per channel subscriber.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Relay transport disconnected")]
    Disconnected,
    #[error("Relay transport error: {0}")]
    Transport(String),
    #[error("Failed to encode relay message: {0}")]
    Encode(String),
    #[error("Failed to decode relay message: {0}")]
    Decode(String),
}

/// Publish/subscribe transport between instances.
pub trait RelayTransport: Send + Sync {
    fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), RelayError>;

    /// Register interest in a channel. Every call must be paired with one
    /// [`RelayTransport::unsubscribe`].
    fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Arc<Vec<u8>>>, RelayError>;

    fn unsubscribe(&self, channel: &str);
}

// ─── Channel table ───────────────────────────────────────────────────

struct ChannelEntry {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    subscribers: usize,
}

/// Reference-counted channel registry shared by the transports.
#[derive(Default)]
pub(crate) struct ChannelTable {
    channels: Mutex<HashMap<String, ChannelEntry>>,
}

impl ChannelTable {
    /// Returns the receiver and whether this is the channel's first subscriber.
    pub(crate) fn subscribe(&self, channel: &str) -> (broadcast::Receiver<Arc<Vec<u8>>>, bool) {
        let mut channels = self.channels.lock();
        let entry = channels.entry(channel.to_string()).or_insert_with(|| ChannelEntry {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
            subscribers: 0,
        });
        entry.subscribers += 1;
        (entry.sender.subscribe(), entry.subscribers == 1)
    }

    /// Returns true when the last subscriber left and the channel was removed.
    pub(crate) fn release(&self, channel: &str) -> bool {
        let mut channels = self.channels.lock();
        let Some(entry) = channels.get_mut(channel) else {
            return false;
        };
        entry.subscribers = entry.subscribers.saturating_sub(1);
        if entry.subscribers == 0 {
            channels.remove(channel);
            return true;
        }
        false
    }

    /// Deliver to local subscribers. Returns the receiver count.
    pub(crate) fn deliver(&self, channel: &str, payload: Arc<Vec<u8>>) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map_or(0, |entry| entry.sender.send(payload).unwrap_or(0))
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.channels.lock().keys().cloned().collect()
    }

    pub(crate) fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map_or(0, |entry| entry.subscribers)
    }
}

/// In-process transport. Registries sharing one `LocalBus` behave like
/// separate instances sharing a broker.
#[derive(Default)]
pub struct LocalBus {
    table: ChannelTable,
    published: AtomicU64,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.table.subscriber_count(channel)
    }

    pub fn channels(&self) -> Vec<String> {
        self.table.names()
    }

    /// Total publishes seen, from every instance.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl RelayTransport for LocalBus {
    fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), RelayError> {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.table.deliver(channel, Arc::new(payload));
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Arc<Vec<u8>>>, RelayError> {
        Ok(self.table.subscribe(channel).0)
    }

    fn unsubscribe(&self, channel: &str) {
        self.table.release(channel);
    }
}

// ─── Envelope ────────────────────────────────────────────────────────

/// What travels on a relay channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub instance: Uuid,
    pub map_id: String,
    pub update: Vec<u8>,
}

impl RelayEnvelope {
    pub fn encode(&self) -> Result<Vec<u8>, RelayError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| RelayError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RelayError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| RelayError::Decode(e.to_string()))?;
        Ok(envelope)
    }
}

// ─── Relay ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub published: u64,
    pub publish_failures: u64,
    pub received: u64,
    pub applied: u64,
}

/// Per-instance relay endpoint used by every session of a registry.
pub struct Relay {
    instance: Uuid,
    transport: Arc<dyn RelayTransport>,
    config: Arc<SyncConfig>,
    published: AtomicU64,
    publish_failures: AtomicU64,
    received: AtomicU64,
    applied: AtomicU64,
}

impl Relay {
    pub fn new(transport: Arc<dyn RelayTransport>, config: Arc<SyncConfig>) -> Self {
        Self {
            instance: Uuid::new_v4(),
            transport,
            config,
            published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            received: AtomicU64::new(0),
            applied: AtomicU64::new(0),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance
    }

    pub fn transport(&self) -> &Arc<dyn RelayTransport> {
        &self.transport
    }

    /// Publish a locally originated update for `session`.
    pub fn publish(&self, session: &Session, update: &[u8]) -> Result<(), RelayError> {
        let channel = self.config.relay_channel(session.room_name());
        let envelope = RelayEnvelope {
            instance: self.instance,
            map_id: session.map_id().to_string(),
            update: update.to_vec(),
        };
        let result = envelope
            .encode()
            .and_then(|payload| self.transport.publish(&channel, payload));
        match &result {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Relay publish on {channel} failed: {e}");
            }
        }
        result
    }

    /// Subscribe `session` to its room channel and start applying updates
    /// from other instances.
    pub fn attach(self: &Arc<Self>, session: &Arc<Session>) -> Result<RelaySubscription, RelayError> {
        let channel = self.config.relay_channel(session.room_name());
        let mut rx = self.transport.subscribe(&channel)?;
        let relay = self.clone();
        let weak = Arc::downgrade(session);
        let listen_channel = channel.clone();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => relay.handle_incoming(&weak, &payload),
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Relay listener on {listen_channel} skipped {skipped} updates");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        log::debug!("Subscribed to relay channel {channel}");
        Ok(RelaySubscription {
            channel,
            transport: self.transport.clone(),
            task,
        })
    }

    fn handle_incoming(&self, session: &Weak<Session>, payload: &[u8]) {
        let envelope = match RelayEnvelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Dropping relay message: {e}");
                return;
            }
        };
        if envelope.instance == self.instance {
            return;
        }
        self.received.fetch_add(1, Ordering::Relaxed);

        let Some(session) = session.upgrade() else {
            return;
        };
        if envelope.map_id != session.map_id() {
            log::warn!(
                "Relay message for map {} arrived on room {}",
                envelope.map_id,
                session.room_name()
            );
            return;
        }
        match session.apply_remote(&envelope.update) {
            Ok(()) => {
                self.applied.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => log::warn!("Rejected relayed update for map {}: {e}", envelope.map_id),
        }
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
        }
    }
}

/// A session's relay listener. Dropping it stops the listener and releases
/// the channel.
pub struct RelaySubscription {
    channel: String,
    transport: Arc<dyn RelayTransport>,
    task: JoinHandle<()>,
}

impl RelaySubscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        self.task.abort();
        self.transport.unsubscribe(&self.channel);
        log::debug!("Unsubscribed from relay channel {}", self.channel);
    }
}
