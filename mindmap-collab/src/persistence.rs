//! Debounced reconciliation of live documents into the durable store.
//!
//! ```text
//! doc update ──► schedule ──┬─► pending snapshot (cache, TTL)   immediate
//!                           └─► debounce timer ──► reconcile     after quiet period
//!
//! reconcile:  snapshot doc ─► list store rows ─► ReconcilePlan ─► one txn
//!             ─► persisted snapshot ─► drop pending (if nothing newer)
//! ```
//!
//! The pending snapshot is written on every change so a crash inside the
//! debounce window loses nothing: the next session for the map merges it
//! back in. It is only removed after the store holds a state at least as new.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::cache::SnapshotCache;
use crate::config::SyncConfig;
use crate::document::{DocError, DocSnapshot};
use crate::model::{now_millis, ConnectionRecord, NodeRecord};
use crate::session::Session;
use crate::store::{DurableStore, StoreError};

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Document error: {0}")]
    Document(#[from] DocError),
}

// ─── Debounce timer ──────────────────────────────────────────────────

#[derive(Default)]
struct TimerState {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// A single-shot timer where re-arming replaces the previous deadline.
#[derive(Default)]
pub struct DebounceTimer {
    state: Arc<Mutex<TimerState>>,
}

impl DebounceTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fire` after `delay`, cancelling any pending run.
    pub fn reset<F>(&self, delay: Duration, fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock();
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
        state.generation += 1;
        let generation = state.generation;
        let shared = self.state.clone();

        state.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = shared.lock();
                if state.generation != generation {
                    return;
                }
                // Once fired the timer is disarmed; `fire` may re-arm it
                state.handle = None;
            }
            fire.await;
        }));
    }

    /// Returns true if a pending run was cancelled.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        state.generation += 1;
        match state.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().handle.is_some()
    }
}

impl Drop for DebounceTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.state.lock().handle.take() {
            handle.abort();
        }
    }
}

// ─── Reconcile plan ──────────────────────────────────────────────────

/// Row changes that bring the store in line with a document snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub create_nodes: Vec<NodeRecord>,
    pub update_nodes: Vec<NodeRecord>,
    pub delete_nodes: Vec<String>,
    pub create_connections: Vec<ConnectionRecord>,
    pub update_connections: Vec<ConnectionRecord>,
    pub delete_connections: Vec<String>,
}

impl ReconcilePlan {
    /// Rows in the document but not the store are created, rows in both
    /// that differ are updated, rows only in the store are deleted.
    pub fn diff(
        stored_nodes: Vec<NodeRecord>,
        stored_connections: Vec<ConnectionRecord>,
        doc_nodes: &BTreeMap<String, NodeRecord>,
        doc_connections: &BTreeMap<String, ConnectionRecord>,
    ) -> Self {
        let (create_nodes, update_nodes, delete_nodes) = diff_rows(stored_nodes, doc_nodes, |n| &n.id);
        let (create_connections, update_connections, delete_connections) =
            diff_rows(stored_connections, doc_connections, |c| &c.id);
        Self {
            create_nodes,
            update_nodes,
            delete_nodes,
            create_connections,
            update_connections,
            delete_connections,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.create_nodes.is_empty()
            && self.update_nodes.is_empty()
            && self.delete_nodes.is_empty()
            && self.create_connections.is_empty()
            && self.update_connections.is_empty()
            && self.delete_connections.is_empty()
    }

    /// Write the plan in one transaction. Connections are deleted before
    /// nodes so no connection ever points at a missing node mid-transaction.
    pub fn apply(&self, store: &dyn DurableStore, map_id: &str) -> Result<(), StoreError> {
        let mut txn = store.begin(map_id)?;
        if !self.create_nodes.is_empty() {
            txn.create_nodes(&self.create_nodes)?;
        }
        for node in &self.update_nodes {
            txn.update_node(node)?;
        }
        if !self.create_connections.is_empty() {
            txn.create_connections(&self.create_connections)?;
        }
        for connection in &self.update_connections {
            txn.update_connection(connection)?;
        }
        if !self.delete_connections.is_empty() {
            txn.delete_connections(&self.delete_connections)?;
        }
        if !self.delete_nodes.is_empty() {
            txn.delete_nodes(&self.delete_nodes)?;
        }
        txn.touch_updated_at()?;
        txn.commit()
    }
}

fn diff_rows<T, K>(
    stored: Vec<T>,
    current: &BTreeMap<String, T>,
    key: K,
) -> (Vec<T>, Vec<T>, Vec<String>)
where
    T: Clone + PartialEq,
    K: Fn(&T) -> &String,
{
    let mut stored: HashMap<String, T> = stored
        .into_iter()
        .map(|row| (key(&row).clone(), row))
        .collect();

    let mut create = Vec::new();
    let mut update = Vec::new();
    for (id, row) in current {
        match stored.remove(id) {
            None => create.push(row.clone()),
            Some(existing) if existing != *row => update.push(row.clone()),
            Some(_) => {}
        }
    }

    let mut delete: Vec<String> = stored.into_keys().collect();
    delete.sort_unstable();
    (create, update, delete)
}

// ─── Coordinator ─────────────────────────────────────────────────────

/// Outcome of one reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub map_id: String,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Milliseconds since epoch
    pub at: u64,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    pub scheduled: u64,
    pub reconciliations: u64,
    pub failures: u64,
    pub tracked_sessions: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub flushed: usize,
    pub failed: usize,
}

pub struct PersistenceCoordinator {
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn SnapshotCache>,
    config: Arc<SyncConfig>,
    /// Sessions with scheduled persistence, for `flush_all`
    tracked: Mutex<HashMap<String, Weak<Session>>>,
    scheduled: AtomicU64,
    reconciliations: AtomicU64,
    failures: AtomicU64,
}

impl PersistenceCoordinator {
    pub fn new(
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn SnapshotCache>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            store,
            cache,
            config,
            tracked: Mutex::new(HashMap::new()),
            scheduled: AtomicU64::new(0),
            reconciliations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Record a change: refresh the pending snapshot now and (re)arm the
    /// reconciliation timer.
    pub fn schedule(self: &Arc<Self>, session: &Arc<Session>) {
        if session.is_disposed() {
            return;
        }
        self.scheduled.fetch_add(1, Ordering::Relaxed);
        session.bump_revision();

        let key = self.config.pending_key(session.map_id());
        let state = session.doc().encode_state();
        if let Err(e) = self.cache.set(&key, &state, Some(self.config.pending_ttl())) {
            log::warn!("Failed to write pending snapshot for map {}: {e}", session.map_id());
        }

        self.tracked
            .lock()
            .insert(session.map_id().to_string(), Arc::downgrade(session));

        let coordinator = self.clone();
        let weak = Arc::downgrade(session);
        session.persist_timer.reset(self.config.debounce(), async move {
            let Some(session) = weak.upgrade() else {
                return;
            };
            // Failures are logged and counted inside
            let _ = coordinator.reconcile(&session).await;
        });
    }

    /// Write the session's current document into the durable store.
    ///
    /// On failure the pending snapshot stays in the cache so the changes
    /// are recovered by the next load or retried by the next change.
    pub async fn reconcile(&self, session: &Session) -> Result<ReconcileReport, PersistenceError> {
        let _guard = session.reconcile_lock.lock().await;
        let map_id = session.map_id();
        let revision = session.revision();
        let snapshot = session.doc().snapshot();

        let report = match self.write_rows(map_id, &snapshot) {
            Ok(report) => report,
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Reconciliation of map {map_id} failed, pending snapshot kept: {e}");
                return Err(e);
            }
        };
        self.reconciliations.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.cache.set(&self.config.state_key(map_id), &snapshot.state, None) {
            log::warn!("Failed to write persisted snapshot for map {map_id}: {e}");
        }
        // A newer change has its own pending snapshot and timer
        if session.revision() == revision {
            if let Err(e) = self.cache.delete(&self.config.pending_key(map_id)) {
                log::warn!("Failed to clear pending snapshot for map {map_id}: {e}");
            }
        }
        session.mark_persisted(revision);

        log::info!(
            "Reconciled map {map_id}: {} created, {} updated, {} deleted",
            report.created,
            report.updated,
            report.deleted
        );
        Ok(report)
    }

    fn write_rows(&self, map_id: &str, snapshot: &DocSnapshot) -> Result<ReconcileReport, PersistenceError> {
        let stored_nodes = self.store.list_nodes(map_id)?;
        let stored_connections = self.store.list_connections(map_id)?;
        let plan = ReconcilePlan::diff(
            stored_nodes,
            stored_connections,
            &snapshot.nodes,
            &snapshot.connections,
        );

        if !plan.is_empty() {
            plan.apply(self.store.as_ref(), map_id)?;
        }

        Ok(ReconcileReport {
            map_id: map_id.to_string(),
            created: plan.create_nodes.len() + plan.create_connections.len(),
            updated: plan.update_nodes.len() + plan.update_connections.len(),
            deleted: plan.delete_nodes.len() + plan.delete_connections.len(),
            at: now_millis(),
        })
    }

    /// Cancel the debounce and reconcile right away if anything is unsaved.
    pub async fn fire_now(&self, session: &Session) -> Result<Option<ReconcileReport>, PersistenceError> {
        session.persist_timer.cancel();
        if !session.is_dirty() {
            return Ok(None);
        }
        self.reconcile(session).await.map(Some)
    }

    /// Reconcile every tracked session with unsaved changes.
    pub async fn flush_all(&self) -> FlushSummary {
        let sessions: Vec<Arc<Session>> = {
            let mut tracked = self.tracked.lock();
            tracked.retain(|_, weak| weak.strong_count() > 0);
            tracked.values().filter_map(Weak::upgrade).collect()
        };

        let mut summary = FlushSummary::default();
        for session in sessions {
            match self.fire_now(&session).await {
                Ok(Some(_)) => summary.flushed += 1,
                Ok(None) => {}
                Err(_) => summary.failed += 1,
            }
        }
        if summary.flushed > 0 || summary.failed > 0 {
            log::info!(
                "Flushed {} sessions ({} failed)",
                summary.flushed,
                summary.failed
            );
        }
        summary
    }

    /// Stop tracking a session that is being torn down.
    pub fn untrack(&self, session: &Arc<Session>) {
        let mut tracked = self.tracked.lock();
        let same = tracked
            .get(session.map_id())
            .is_some_and(|weak| weak.as_ptr() == Arc::as_ptr(session));
        if same {
            tracked.remove(session.map_id());
        }
    }

    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            reconciliations: self.reconciliations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            tracked_sessions: self.tracked.lock().len(),
        }
    }
}
