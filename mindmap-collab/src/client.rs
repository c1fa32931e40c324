//! WebSocket sync client and offline-edit tracking.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with backoff)
//! - The sync handshake and live updates against a local [`MindMapDoc`]
//! - Awareness sends
//! - [`OfflineCoordinator`]: counts edits made while disconnected and
//!   clears the count once a reconnect has had time to deliver them
//!
//! Offline edits need no replay queue: they live in the local document and
//! the handshake on reconnect sends the server exactly what it is missing.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::document::{DocError, MindMapDoc, UpdateOrigin, UpdateSubscription};
use crate::model::now_millis;
use crate::protocol::Frame;

/// How long after reconnecting the offline counter waits before clearing.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(1000);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Document error: {0}")]
    Document(#[from] DocError),
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("Gave up after {0} connection attempts")]
    Exhausted(u32),
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Ledger format error: {0}")]
    Format(#[from] serde_json::Error),
}

// ─── Offline ledger ──────────────────────────────────────────────────

/// What survives a client restart about unsynced work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OfflineLedger {
    pub pending_changes: u64,
    pub made_offline: bool,
    /// Milliseconds since epoch
    pub last_synced_at: Option<u64>,
}

pub trait LedgerStore: Send + Sync {
    fn load(&self) -> Result<OfflineLedger, LedgerError>;
    fn save(&self, ledger: &OfflineLedger) -> Result<(), LedgerError>;
}

/// JSON file on local disk.
pub struct FileLedger {
    path: PathBuf,
}

impl FileLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LedgerStore for FileLedger {
    fn load(&self) -> Result<OfflineLedger, LedgerError> {
        match std::fs::read_to_string(&self.path) {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(OfflineLedger::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, ledger: &OfflineLedger) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename keeps the previous ledger intact on a crash
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(ledger)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    ledger: Mutex<OfflineLedger>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryLedger {
    fn load(&self) -> Result<OfflineLedger, LedgerError> {
        Ok(self.ledger.lock().clone())
    }

    fn save(&self, ledger: &OfflineLedger) -> Result<(), LedgerError> {
        *self.ledger.lock() = ledger.clone();
        Ok(())
    }
}

// ─── Offline coordinator ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineState {
    Synced,
    Offline,
    Syncing,
}

struct OfflineInner {
    state: OfflineState,
    ledger: OfflineLedger,
}

pub struct OfflineCoordinator {
    inner: Mutex<OfflineInner>,
    store: Arc<dyn LedgerStore>,
    settle_window: Duration,
    /// Bumped on every connectivity change; a settle from an older
    /// generation is stale
    generation: AtomicU64,
}

impl OfflineCoordinator {
    /// Restore from `store`. A client that starts with unsynced edits
    /// starts offline.
    pub fn new(store: Arc<dyn LedgerStore>, settle: Duration) -> Result<Arc<Self>, LedgerError> {
        let ledger = store.load()?;
        let state = if ledger.pending_changes > 0 {
            OfflineState::Offline
        } else {
            OfflineState::Synced
        };
        Ok(Arc::new(Self {
            inner: Mutex::new(OfflineInner { state, ledger }),
            store,
            settle_window: settle,
            generation: AtomicU64::new(0),
        }))
    }

    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(OfflineInner {
                state: OfflineState::Synced,
                ledger: OfflineLedger::default(),
            }),
            store: Arc::new(MemoryLedger::new()),
            settle_window: DEFAULT_SETTLE,
            generation: AtomicU64::new(0),
        })
    }

    pub fn on_disconnected(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let mut inner = self.inner.lock();
        if inner.state != OfflineState::Offline {
            inner.state = OfflineState::Offline;
            log::info!("Offline, {} unsynced changes", inner.ledger.pending_changes);
        }
    }

    /// Count a document change. Only local edits made while offline count.
    pub fn on_local_change(&self, origin: UpdateOrigin) -> bool {
        if origin != UpdateOrigin::Local {
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.state != OfflineState::Offline {
            return false;
        }
        inner.ledger.pending_changes += 1;
        inner.ledger.made_offline = true;
        self.persist(&inner.ledger);
        true
    }

    /// Start settling. The counter clears after the settle window unless
    /// the connection drops again first.
    pub fn on_reconnected(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut inner = self.inner.lock();
            if inner.ledger.pending_changes == 0 {
                inner.state = OfflineState::Synced;
                return None;
            }
            inner.state = OfflineState::Syncing;
            log::info!(
                "Reconnected, settling {} offline changes",
                inner.ledger.pending_changes
            );
        }

        let this = self.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(this.settle_window).await;
            this.settle(generation);
        }))
    }

    fn settle(&self, generation: u64) {
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.state != OfflineState::Syncing {
            return;
        }
        inner.ledger.pending_changes = 0;
        inner.ledger.made_offline = false;
        inner.ledger.last_synced_at = Some(now_millis());
        inner.state = OfflineState::Synced;
        self.persist(&inner.ledger);
        log::info!("Offline changes synced");
    }

    fn persist(&self, ledger: &OfflineLedger) {
        if let Err(e) = self.store.save(ledger) {
            log::warn!("Failed to save offline ledger: {e}");
        }
    }

    pub fn state(&self) -> OfflineState {
        self.inner.lock().state
    }

    pub fn pending_changes(&self) -> u64 {
        self.inner.lock().ledger.pending_changes
    }

    pub fn made_offline(&self) -> bool {
        self.inner.lock().ledger.made_offline
    }

    pub fn last_synced_at(&self) -> Option<u64> {
        self.inner.lock().ledger.last_synced_at
    }

    pub fn ledger(&self) -> OfflineLedger {
        self.inner.lock().ledger.clone()
    }
}

// ─── Sync client ─────────────────────────────────────────────────────

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    /// The server's step 2 was applied; the local document has everything
    /// the server had
    Synced,
    /// A remote update was applied (payload size in bytes)
    RemoteUpdate(usize),
    /// Raw awareness update from the room
    Awareness(Vec<u8>),
    Disconnected,
}

type Outgoing = Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>;

/// The sync client.
///
/// Keeps a local [`MindMapDoc`] in sync with one room. Local edits go
/// straight to the server while connected and wait in the document while
/// not.
pub struct SyncClient {
    url: String,
    doc: Arc<MindMapDoc>,
    offline: Arc<OfflineCoordinator>,
    state: Arc<Mutex<ConnectionState>>,
    outgoing: Outgoing,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<ClientEvent>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    _observer: UpdateSubscription,
}

impl SyncClient {
    /// `server_url` is the WebSocket base (e.g. `ws://host:9090`), `room`
    /// the full room name.
    pub fn new(
        server_url: &str,
        room: &str,
        offline: Arc<OfflineCoordinator>,
    ) -> Result<Self, ClientError> {
        let doc = Arc::new(MindMapDoc::new()?);
        let outgoing: Outgoing = Arc::new(Mutex::new(None));

        let sink = outgoing.clone();
        let tracker = offline.clone();
        let observer = doc.observe(move |update, origin| {
            tracker.on_local_change(origin);
            if origin != UpdateOrigin::Local {
                return;
            }
            if let Some(tx) = sink.lock().as_ref() {
                let _ = tx.send(Frame::Update(update.to_vec()).encode());
            }
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Ok(Self {
            url: format!("{}/{room}", server_url.trim_end_matches('/')),
            doc,
            offline,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            outgoing,
            event_tx,
            event_rx: Some(event_rx),
            tasks: Mutex::new(Vec::new()),
            _observer: observer,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub fn doc(&self) -> &Arc<MindMapDoc> {
        &self.doc
    }

    pub fn offline(&self) -> &Arc<OfflineCoordinator> {
        &self.offline
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Connect and start the handshake.
    ///
    /// Spawns a writer and a reader task. The reader answers the server's
    /// step 1, applies everything else to the local document and reports
    /// the connection lost when the socket ends.
    pub async fn connect(&self) -> Result<(), ClientError> {
        *self.state.lock() = ConnectionState::Connecting;
        let ws_stream = match tokio_tungstenite::connect_async(&self.url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.lock() = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        // Our step 1 goes first so the server can answer with what we lack
        let _ = out_tx.send(Frame::SyncStep1(self.doc.state_vector()).encode());
        *self.outgoing.lock() = Some(out_tx.clone());
        *self.state.lock() = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected);
        self.offline.on_reconnected();

        let writer = tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let doc = self.doc.clone();
        let offline = self.offline.clone();
        let state = self.state.clone();
        let outgoing = self.outgoing.clone();
        let event_tx = self.event_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let data = match msg {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match Frame::decode(&data) {
                    Ok(Frame::SyncStep1(state_vector)) => match doc.diff_update(&state_vector) {
                        Ok(diff) => {
                            let _ = out_tx.send(Frame::SyncStep2(diff).encode());
                        }
                        Err(e) => log::warn!("Server sent an unreadable state vector: {e}"),
                    },
                    Ok(Frame::SyncStep2(update)) => match doc.apply_update(&update, UpdateOrigin::Remote) {
                        Ok(()) => {
                            let _ = event_tx.send(ClientEvent::Synced);
                        }
                        Err(e) => log::warn!("Rejected sync step 2 from server: {e}"),
                    },
                    Ok(Frame::Update(update)) => match doc.apply_update(&update, UpdateOrigin::Remote) {
                        Ok(()) => {
                            let _ = event_tx.send(ClientEvent::RemoteUpdate(update.len()));
                        }
                        Err(e) => log::warn!("Rejected update from server: {e}"),
                    },
                    Ok(Frame::Awareness(payload)) => {
                        let _ = event_tx.send(ClientEvent::Awareness(payload));
                    }
                    Err(e) => log::warn!("Malformed frame from server: {e}"),
                }
            }

            // Connection lost
            *outgoing.lock() = None;
            *state.lock() = ConnectionState::Disconnected;
            offline.on_disconnected();
            let _ = event_tx.send(ClientEvent::Disconnected);
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(writer);
        tasks.push(reader);
        Ok(())
    }

    /// Close the connection. Local edits keep accumulating offline.
    pub fn disconnect(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.outgoing.lock() = None;
        let was_connected = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, ConnectionState::Disconnected) != ConnectionState::Disconnected
        };
        self.offline.on_disconnected();
        if was_connected {
            let _ = self.event_tx.send(ClientEvent::Disconnected);
        }
    }

    /// Retry `connect` with exponential backoff starting at `base`.
    pub async fn reconnect_with_backoff(&self, attempts: u32, base: Duration) -> Result<(), ClientError> {
        let mut delay = base;
        for attempt in 1..=attempts {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("Connect attempt {attempt}/{attempts} to {} failed: {e}", self.url);
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_secs(30));
                    }
                }
            }
        }
        Err(ClientError::Exhausted(attempts))
    }

    /// Send an awareness update. Dropped silently while disconnected.
    pub fn send_awareness(&self, payload: Vec<u8>) -> bool {
        match self.outgoing.lock().as_ref() {
            Some(tx) => tx.send(Frame::Awareness(payload).encode()).is_ok(),
            None => false,
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeRecord;

    #[tokio::test(start_paused = true)]
    async fn test_offline_edits_counted_and_settled() {
        let offline = OfflineCoordinator::in_memory();
        assert_eq!(offline.state(), OfflineState::Synced);

        offline.on_disconnected();
        assert!(offline.on_local_change(UpdateOrigin::Local));
        assert!(offline.on_local_change(UpdateOrigin::Local));
        assert!(!offline.on_local_change(UpdateOrigin::Remote));
        assert_eq!(offline.pending_changes(), 2);
        assert!(offline.made_offline());

        let settle = offline.on_reconnected().unwrap();
        assert_eq!(offline.state(), OfflineState::Syncing);
        settle.await.unwrap();

        assert_eq!(offline.state(), OfflineState::Synced);
        assert_eq!(offline.pending_changes(), 0);
        assert!(!offline.made_offline());
        assert!(offline.last_synced_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_settle_keeps_count() {
        let offline = OfflineCoordinator::in_memory();
        offline.on_disconnected();
        offline.on_local_change(UpdateOrigin::Local);

        let settle = offline.on_reconnected().unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        offline.on_disconnected();
        settle.await.unwrap();

        assert_eq!(offline.state(), OfflineState::Offline);
        assert_eq!(offline.pending_changes(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_without_pending_is_immediate() {
        let offline = OfflineCoordinator::in_memory();
        offline.on_disconnected();
        assert!(offline.on_reconnected().is_none());
        assert_eq!(offline.state(), OfflineState::Synced);
    }

    #[test]
    fn test_online_edits_not_counted() {
        let offline = OfflineCoordinator::in_memory();
        assert!(!offline.on_local_change(UpdateOrigin::Local));
        assert_eq!(offline.pending_changes(), 0);
    }

    #[test]
    fn test_file_ledger_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.json");
        {
            let offline = OfflineCoordinator::new(Arc::new(FileLedger::new(&path)), DEFAULT_SETTLE).unwrap();
            offline.on_disconnected();
            offline.on_local_change(UpdateOrigin::Local);
        }

        let json = std::fs::read_to_string(&path).unwrap();
        assert!(json.contains("\"pendingChanges\": 1"));

        let offline = OfflineCoordinator::new(Arc::new(FileLedger::new(&path)), DEFAULT_SETTLE).unwrap();
        assert_eq!(offline.pending_changes(), 1);
        assert_eq!(offline.state(), OfflineState::Offline);
    }

    #[test]
    fn test_missing_ledger_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FileLedger::new(dir.path().join("absent.json"));
        assert_eq!(ledger.load().unwrap(), OfflineLedger::default());
    }

    #[tokio::test]
    async fn test_client_edits_offline_are_counted() {
        let offline = OfflineCoordinator::in_memory();
        let client = SyncClient::new("ws://127.0.0.1:9", "mindmap-m1", offline.clone()).unwrap();
        assert_eq!(client.url(), "ws://127.0.0.1:9/mindmap-m1");
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);

        client.disconnect();
        client
            .doc()
            .upsert_node(&NodeRecord::new("a", "A"), UpdateOrigin::Local)
            .unwrap();
        assert_eq!(offline.pending_changes(), 1);
        assert!(!client.send_awareness(vec![0]));
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new("ws://127.0.0.1:9", "mindmap-m1", OfflineCoordinator::in_memory()).unwrap();
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
