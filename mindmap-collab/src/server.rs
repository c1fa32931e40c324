//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! ws://host/mindmap-<mapId>
//!        │ room from the last path segment
//!        ▼
//! ConnectionHandler ──► SessionRegistry ──► Session (MindMapDoc + fan-out)
//!        ▲                                     │
//!        └──────── room frames (echo-filtered) ┘
//!                                              ├── PersistenceCoordinator ──► DurableStore
//!                                              │                          └─► SnapshotCache
//!                                              └── Relay ──► other instances
//! ```
//!
//! One task per socket runs a `select!` loop over inbound frames, the room
//! fan-out and the heartbeat. Whatever ends the loop, the handler is closed
//! so the session sees the departure.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::cache::{CacheConfig, CacheError, MemoryCache, RocksCache, SnapshotCache};
use crate::config::SyncConfig;
use crate::handler::ConnectionHandler;
use crate::registry::{SessionError, SessionRegistry};
use crate::relay::{LocalBus, Relay, RelayTransport, RemoteBus};
use crate::store::{DurableStore, MemoryStore, RocksStore, StoreConfig, StoreError};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub protocol_errors: u64,
    pub active_rooms: usize,
}

/// The sync server.
pub struct SyncServer {
    config: Arc<SyncConfig>,
    registry: Arc<SessionRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Serve an existing registry.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            config: registry.config().clone(),
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Build the backends named by `config`: RocksDB under `storage_path`
    /// or in-memory, and a broker connection or an in-process relay.
    pub fn open(config: SyncConfig) -> Result<Self, ServerError> {
        let config = Arc::new(config);

        let (store, cache): (Arc<dyn DurableStore>, Arc<dyn SnapshotCache>) =
            match &config.storage_path {
                Some(path) => {
                    let store = RocksStore::open(StoreConfig {
                        path: path.join("store"),
                        ..StoreConfig::default()
                    })?;
                    let cache = RocksCache::open(CacheConfig {
                        path: path.join("cache"),
                        ..CacheConfig::default()
                    })?;
                    log::info!("Persisting to {}", path.display());
                    (Arc::new(store), Arc::new(cache))
                }
                None => {
                    log::warn!("No storage path configured, maps live in memory only");
                    (Arc::new(MemoryStore::new()), Arc::new(MemoryCache::new()))
                }
            };

        let transport: Arc<dyn RelayTransport> = match &config.relay_url {
            Some(url) => {
                log::info!("Relaying updates through {url}");
                Arc::new(RemoteBus::connect(url.clone()))
            }
            None => Arc::new(LocalBus::new()),
        };

        let relay = Arc::new(Relay::new(transport, config.clone()));
        let registry = SessionRegistry::new(config, store, cache, relay);
        Ok(Self::new(registry))
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        let sweeper = self.spawn_awareness_sweep();
        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        result
    }

    fn spawn_awareness_sweep(&self) -> Option<tokio::task::JoinHandle<()>> {
        let period = self.config.awareness_timeout() / 2;
        if period.is_zero() {
            return None;
        }
        let registry = self.registry.clone();
        Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                registry.sweep_awareness().await;
            }
        }))
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        config: Arc<SyncConfig>,
    ) -> Result<(), ServerError> {
        let mut path = String::new();
        let mut ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                path = request.uri().path().to_string();
                Ok(response)
            },
        )
        .await?;

        let room = path.rsplit('/').next().unwrap_or_default();
        let Some(map_id) = config.map_id_from_room(room) else {
            log::warn!("Rejecting {addr}: {path:?} does not name a mind-map room");
            stats.write().await.rejected_connections += 1;
            let close = CloseFrame {
                code: CloseCode::Policy,
                reason: "unknown room".into(),
            };
            let _ = ws_stream.send(Message::Close(Some(close))).await;
            return Ok(());
        };

        let (mut handler, mut room_rx) = ConnectionHandler::open(&registry, map_id).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("Connection {} from {addr} joined {room}", handler.id());

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let heartbeat_period = config.heartbeat_interval().max(Duration::from_secs(1));
        let result = async {
            for frame in handler.greeting() {
                ws_sender.send(Message::Binary(frame.into())).await?;
            }

            let mut heartbeat = tokio::time::interval(heartbeat_period);
            // The first tick completes immediately
            heartbeat.tick().await;

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            match handler.handle_frame(&data) {
                                Ok(replies) => {
                                    for reply in replies {
                                        ws_sender.send(Message::Binary(reply.into())).await?;
                                    }
                                }
                                Err(e) => {
                                    log::warn!("Closing connection {} from {addr}: {e}", handler.id());
                                    stats.write().await.protocol_errors += 1;
                                    let close = CloseFrame {
                                        code: CloseCode::Invalid,
                                        reason: "rejected frame".into(),
                                    };
                                    let _ = ws_sender.send(Message::Close(Some(close))).await;
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {} from {addr} closed", handler.id());
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        // Pings are answered by tungstenite; text is not part of the protocol
                        Some(Ok(_)) => {}
                    },

                    frame = room_rx.recv() => match frame {
                        Ok(frame) => {
                            if let Some(bytes) = handler.forward(&frame) {
                                ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            log::warn!("Connection {} lagged by {skipped} frames, resyncing", handler.id());
                            handler.session().fanout().record_lagged(skipped);
                            ws_sender.send(Message::Binary(handler.resync().into())).await?;
                        }
                        Err(RecvError::Closed) => break,
                    },

                    _ = heartbeat.tick() => {
                        ws_sender.send(Message::Ping(Default::default())).await?;
                    }
                }
            }
            Ok::<(), ServerError>(())
        }
        .await;

        handler.close();
        let active_rooms = registry.session_count().await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = active_rooms;
        }
        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.session_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Flush every dirty session and release all sessions.
    pub async fn shutdown(&self) {
        log::info!("Sync server shutting down");
        self.registry.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory() {
        let server = SyncServer::open(SyncConfig::for_testing()).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:0");

        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_open_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            storage_path: Some(dir.path().to_path_buf()),
            ..SyncConfig::for_testing()
        };
        let server = SyncServer::open(config).unwrap();

        assert!(dir.path().join("store").exists());
        assert!(dir.path().join("cache").exists());
        server.shutdown().await;
    }
}
