//! # mindmap-collab — Real-time collaborative mind-map sync engine
//!
//! Keeps one CRDT document per mind map consistent across WebSocket
//! clients and server instances, and reconciles it into a durable row
//! store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌──────────────────┐    relay     ┌──────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer       │ ◄──────────► │ other        │
//! │ + Offline   │  y-protocols frames │  SessionRegistry │  envelopes   │ instances    │
//! │ Coordinator │                     │   └─ Session     │              └──────────────┘
//! └─────────────┘                     │      MindMapDoc  │
//!                                     └────────┬─────────┘
//!                                              │ debounced
//!                                   ┌──────────┴──────────┐
//!                                   ▼                     ▼
//!                            ┌─────────────┐       ┌─────────────┐
//!                            │ SnapshotCache│       │ DurableStore│
//!                            │ state/pending│       │ rows + txn  │
//!                            └─────────────┘       └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`] — CRDT document with `nodes` / `connections` maps and origin-tagged updates
//! - [`protocol`] — Sync and awareness frame codec
//! - [`awareness`] — Per-room presence state
//! - [`broadcast`] — Room fan-out with echo suppression
//! - [`session`] / [`registry`] — Session lifecycle, loading and grace-period teardown
//! - [`handler`] — Per-connection protocol state machine
//! - [`persistence`] — Debounced reconciliation into the durable store
//! - [`relay`] — Cross-instance update relay (in-process or via broker)
//! - [`cache`] / [`store`] — Snapshot cache and durable store adapters
//! - [`server`] / [`client`] — WebSocket endpoints

pub mod awareness;
pub mod broadcast;
pub mod cache;
pub mod client;
pub mod config;
pub mod document;
pub mod handler;
pub mod model;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod store;

// Re-exports for convenience
pub use awareness::{AwarenessChange, AwarenessError, AwarenessRegistry};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomFrame};
pub use cache::{CacheConfig, CacheError, MemoryCache, RocksCache, SnapshotCache};
pub use client::{
    ClientError, ClientEvent, ConnectionState, FileLedger, LedgerStore, MemoryLedger,
    OfflineCoordinator, OfflineLedger, OfflineState, SyncClient,
};
pub use config::{ConfigError, SyncConfig};
pub use document::{ConnectionId, DocError, DocSnapshot, MindMapDoc, UpdateOrigin, UpdateSubscription};
pub use handler::{ConnState, ConnectionHandler};
pub use model::{ConnectionRecord, NodeRecord};
pub use persistence::{
    DebounceTimer, PersistenceCoordinator, PersistenceError, PersistenceStats, ReconcilePlan,
    ReconcileReport,
};
pub use protocol::{Frame, ProtocolError};
pub use registry::{LoadSource, SessionError, SessionRegistry};
pub use relay::{LocalBus, Relay, RelayBroker, RelayError, RelayTransport, RemoteBus};
pub use server::{ServerError, ServerStats, SyncServer};
pub use session::Session;
pub use store::{DurableStore, MemoryStore, RocksStore, StoreConfig, StoreError, StoreTxn};
