//! Awareness (presence) registry for one room.
//!
//! Awareness is ephemeral: who is in the room, where their cursor is, what
//! they have selected. It is never persisted. Payloads use the y-protocols
//! awareness encoding:
//!
//! ```text
//! varuint count
//! repeat count:
//!   varuint client_id
//!   varuint clock
//!   varstring state_json      ("null" = client removed)
//! ```
//!
//! An entry is accepted when it is new, when its clock is newer, or when it
//! removes a live state at the same clock. Entries remember the connection
//! that last renewed them so they can be cleared when that socket closes.
//! Timestamps use the tokio clock so idle pruning follows paused test time.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

use crate::document::ConnectionId;

const REMOVED_STATE: &str = "null";

#[derive(Error, Debug)]
pub enum AwarenessError {
    #[error("Malformed awareness update: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct AwarenessEntry {
    pub clock: u32,
    /// JSON state; `None` once the client has been removed
    pub state: Option<String>,
    pub last_updated: Instant,
    pub owner: Option<ConnectionId>,
}

impl AwarenessEntry {
    /// A clock already at `u32::MAX` stays there; peers still accept a
    /// removal at an equal clock.
    fn mark_removed(&mut self, now: Instant) {
        self.clock = self.clock.saturating_add(1);
        self.state = None;
        self.last_updated = now;
    }
}

/// Client ids touched by one awareness update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn changed(&self) -> Vec<u64> {
        let mut ids = Vec::with_capacity(self.added.len() + self.updated.len() + self.removed.len());
        ids.extend(&self.added);
        ids.extend(&self.updated);
        ids.extend(&self.removed);
        ids
    }
}

/// Per-room awareness state.
pub struct AwarenessRegistry {
    entries: HashMap<u64, AwarenessEntry>,
    /// Entries not renewed within this window are pruned
    idle_timeout: Duration,
}

impl AwarenessRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            idle_timeout,
        }
    }

    /// Merge an encoded awareness update received from `origin`.
    pub fn apply_update(
        &mut self,
        payload: &[u8],
        origin: Option<ConnectionId>,
    ) -> Result<AwarenessChange, AwarenessError> {
        self.apply_update_at(payload, origin, Instant::now())
    }

    fn apply_update_at(
        &mut self,
        payload: &[u8],
        origin: Option<ConnectionId>,
        now: Instant,
    ) -> Result<AwarenessChange, AwarenessError> {
        let mut change = AwarenessChange::default();
        for (client_id, clock, state) in decode_entries(payload)? {
            let previous = self.entries.get(&client_id);
            let accept = match previous {
                None => true,
                Some(prev) => {
                    prev.clock < clock
                        || (prev.clock == clock && state.is_none() && prev.state.is_some())
                }
            };
            if !accept {
                continue;
            }

            let was_live = previous.is_some_and(|prev| prev.state.is_some());
            let owner = origin.or(previous.and_then(|prev| prev.owner));
            match (&state, was_live) {
                (None, true) => change.removed.push(client_id),
                (None, false) => {}
                (Some(_), true) => change.updated.push(client_id),
                (Some(_), false) => change.added.push(client_id),
            }
            self.entries.insert(
                client_id,
                AwarenessEntry {
                    clock,
                    state,
                    last_updated: now,
                    owner,
                },
            );
        }
        Ok(change)
    }

    /// Encode the current entries for the given client ids.
    pub fn encode_update(&self, client_ids: &[u64]) -> Vec<u8> {
        let entries: Vec<(u64, &AwarenessEntry)> = client_ids
            .iter()
            .filter_map(|id| self.entries.get(id).map(|entry| (*id, entry)))
            .collect();

        let mut buf = Vec::new();
        buf.write_var(entries.len() as u32);
        for (client_id, entry) in entries {
            buf.write_var(client_id);
            buf.write_var(entry.clock);
            buf.write_string(entry.state.as_deref().unwrap_or(REMOVED_STATE));
        }
        buf
    }

    /// Encoded states of every live client, for a newly joined connection.
    pub fn encode_live(&self) -> Option<Vec<u8>> {
        let mut live: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.state.is_some())
            .map(|(id, _)| *id)
            .collect();
        if live.is_empty() {
            return None;
        }
        live.sort_unstable();
        Some(self.encode_update(&live))
    }

    /// Remove every live entry last renewed by `connection`.
    ///
    /// Returns the removed client ids; their clocks are bumped so the encoded
    /// removal wins over the last state peers have seen.
    pub fn remove_owned_by(&mut self, connection: ConnectionId) -> Vec<u64> {
        let now = Instant::now();
        let mut removed: Vec<u64> = Vec::new();
        for (client_id, entry) in self.entries.iter_mut() {
            if entry.owner == Some(connection) && entry.state.is_some() {
                entry.mark_removed(now);
                removed.push(*client_id);
            }
        }
        removed.sort_unstable();
        removed
    }

    /// Remove live entries not renewed within the idle timeout.
    pub fn prune_idle(&mut self, now: Instant) -> Vec<u64> {
        let timeout = self.idle_timeout;
        let mut removed: Vec<u64> = Vec::new();
        for (client_id, entry) in self.entries.iter_mut() {
            if entry.state.is_some() && now.saturating_duration_since(entry.last_updated) >= timeout {
                entry.mark_removed(now);
                removed.push(*client_id);
            }
        }
        removed.sort_unstable();
        removed
    }

    pub fn get(&self, client_id: u64) -> Option<&AwarenessEntry> {
        self.entries.get(&client_id)
    }

    /// JSON state of a live client.
    pub fn state(&self, client_id: u64) -> Option<&str> {
        self.entries.get(&client_id).and_then(|e| e.state.as_deref())
    }

    /// Number of live clients.
    pub fn live_count(&self) -> usize {
        self.entries.values().filter(|e| e.state.is_some()).count()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

impl Default for AwarenessRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Decode an awareness update into `(client_id, clock, state)` triples.
pub fn decode_entries(payload: &[u8]) -> Result<Vec<(u64, u32, Option<String>)>, AwarenessError> {
    let mut cursor = Cursor::new(payload);
    let count: u32 = cursor.read_var().map_err(malformed)?;
    let mut entries = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let client_id: u64 = cursor.read_var().map_err(malformed)?;
        let clock: u32 = cursor.read_var().map_err(malformed)?;
        let json = cursor.read_string().map_err(malformed)?;
        let state = if json == REMOVED_STATE {
            None
        } else {
            Some(json.to_string())
        };
        entries.push((client_id, clock, state));
    }
    Ok(entries)
}

/// Encode `(client_id, clock, state)` triples.
pub fn encode_entries(entries: &[(u64, u32, Option<&str>)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_var(entries.len() as u32);
    for (client_id, clock, state) in entries {
        buf.write_var(*client_id);
        buf.write_var(*clock);
        buf.write_string(state.unwrap_or(REMOVED_STATE));
    }
    buf
}

fn malformed(e: yrs::encoding::read::Error) -> AwarenessError {
    AwarenessError::Malformed(e.to_string())
}
