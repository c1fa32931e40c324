//! Standalone publish/subscribe broker for multi-instance deployments.
//!
//! Each sync server connects one [`super::RemoteBus`] to the broker over a
//! WebSocket and exchanges bincode-encoded [`BusFrame`]s. A publish is
//! delivered to every peer subscribed to the channel, the publisher
//! included; relay envelopes carry the instance id for that reason.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{ChannelTable, RelayError};

/// Frames exchanged between a [`super::RemoteBus`] and the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusFrame {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Publish { channel: String, payload: Vec<u8> },
}

impl BusFrame {
    pub fn encode(&self) -> Result<Vec<u8>, RelayError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| RelayError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RelayError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| RelayError::Decode(e.to_string()))?;
        Ok(frame)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub total_peers: u64,
    pub active_peers: u64,
    pub published: u64,
}

#[derive(Default)]
struct BrokerCounters {
    total_peers: AtomicU64,
    active_peers: AtomicU64,
    published: AtomicU64,
}

pub struct RelayBroker {
    bind_addr: String,
    table: Arc<ChannelTable>,
    counters: Arc<BrokerCounters>,
}

impl RelayBroker {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            table: Arc::new(ChannelTable::default()),
            counters: Arc::new(BrokerCounters::default()),
        }
    }

    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        self.serve(listener).await
    }

    /// Accept peers on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        if let Ok(addr) = listener.local_addr() {
            log::info!("Relay broker listening on {addr}");
        }

        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| RelayError::Transport(e.to_string()))?;

            let table = self.table.clone();
            let counters = self.counters.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_peer(stream, addr, table, counters).await {
                    log::warn!("Relay peer {addr} failed: {e}");
                }
            });
        }
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            total_peers: self.counters.total_peers.load(Ordering::Relaxed),
            active_peers: self.counters.active_peers.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
        }
    }

    async fn handle_peer(
        stream: TcpStream,
        addr: SocketAddr,
        table: Arc<ChannelTable>,
        counters: Arc<BrokerCounters>,
    ) -> Result<(), RelayError> {
        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        counters.total_peers.fetch_add(1, Ordering::Relaxed);
        counters.active_peers.fetch_add(1, Ordering::Relaxed);
        log::info!("Relay peer connected from {addr}");

        // Forwarders push already-encoded Publish frames here
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Arc<Vec<u8>>>();
        let writer = tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                if ws_sender
                    .send(Message::Binary(bytes.to_vec().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();

        while let Some(msg) = ws_receiver.next().await {
            let data = match msg {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };

            match BusFrame::decode(&data) {
                Ok(BusFrame::Subscribe { channel }) => {
                    if subscriptions.contains_key(&channel) {
                        continue;
                    }
                    let (mut rx, _) = table.subscribe(&channel);
                    let out = out_tx.clone();
                    let name = channel.clone();
                    let forwarder = tokio::spawn(async move {
                        loop {
                            match rx.recv().await {
                                Ok(frame) => {
                                    if out.send(frame).is_err() {
                                        break;
                                    }
                                }
                                Err(RecvError::Lagged(skipped)) => {
                                    log::warn!("Relay peer {addr} lagged {skipped} frames on {name}");
                                }
                                Err(RecvError::Closed) => break,
                            }
                        }
                    });
                    subscriptions.insert(channel, forwarder);
                }
                Ok(BusFrame::Unsubscribe { channel }) => {
                    if let Some(forwarder) = subscriptions.remove(&channel) {
                        forwarder.abort();
                        table.release(&channel);
                    }
                }
                Ok(BusFrame::Publish { channel, .. }) => {
                    counters.published.fetch_add(1, Ordering::Relaxed);
                    // Forward the frame as received
                    table.deliver(&channel, Arc::new(data.to_vec()));
                }
                Err(e) => log::warn!("Dropping malformed frame from relay peer {addr}: {e}"),
            }
        }

        for (channel, forwarder) in subscriptions {
            forwarder.abort();
            table.release(&channel);
        }
        writer.abort();
        counters.active_peers.fetch_sub(1, Ordering::Relaxed);
        log::info!("Relay peer {addr} disconnected");
        Ok(())
    }
}
