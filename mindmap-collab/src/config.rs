//! Engine configuration.
//!
//! Every key is optional; a TOML file only needs to name what it overrides:
//!
//! ```toml
//! bindAddr = "0.0.0.0:9090"
//! debounceMs = 2000
//! storagePath = "/var/lib/mindmap"
//! relayUrl = "ws://relay.internal:9191"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Runtime configuration shared by every component of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Address the sync server binds to
    pub bind_addr: String,
    /// Quiet period before a session is reconciled into the durable store
    pub debounce_ms: u64,
    /// Lifetime of the pending snapshot in the cache
    pub pending_ttl_seconds: u64,
    /// How long an empty room survives before it is destroyed
    pub room_grace_ms: u64,
    /// Room name = prefix + map id
    pub room_prefix: String,
    /// Relay channel = prefix + room name
    pub relay_channel_prefix: String,
    /// Namespace for snapshot cache keys
    pub cache_key_prefix: String,
    /// Frames buffered per connection before it is considered lagging
    pub broadcast_capacity: usize,
    /// Largest inbound frame accepted from a client
    pub max_frame_bytes: usize,
    /// Interval between server pings on idle sockets
    pub heartbeat_interval_secs: u64,
    /// Awareness entries not renewed within this window are pruned
    pub awareness_timeout_ms: u64,
    /// RocksDB directory for the store and cache (None = in-memory)
    pub storage_path: Option<PathBuf>,
    /// Relay broker URL (None = in-process relay)
    pub relay_url: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            debounce_ms: 2_000,
            pending_ttl_seconds: 3_600,
            room_grace_ms: 30_000,
            room_prefix: "mindmap-".to_string(),
            relay_channel_prefix: "yjs:updates:".to_string(),
            cache_key_prefix: "yjs:".to_string(),
            broadcast_capacity: 256,
            max_frame_bytes: 16 * 1024 * 1024, // 16MB
            heartbeat_interval_secs: 30,
            awareness_timeout_ms: 30_000,
            storage_path: None,
            relay_url: None,
        }
    }
}

impl SyncConfig {
    /// Config for tests: ephemeral port, in-memory backends.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            ..Self::default()
        }
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Load a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_seconds)
    }

    pub fn room_grace(&self) -> Duration {
        Duration::from_millis(self.room_grace_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn awareness_timeout(&self) -> Duration {
        Duration::from_millis(self.awareness_timeout_ms)
    }

    // ─── Naming ──────────────────────────────────────────────────────

    pub fn room_name(&self, map_id: &str) -> String {
        format!("{}{map_id}", self.room_prefix)
    }

    /// Extract the map id from a room name. Returns `None` for foreign rooms
    /// and for an empty id.
    pub fn map_id_from_room<'a>(&self, room: &'a str) -> Option<&'a str> {
        room.strip_prefix(self.room_prefix.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn relay_channel(&self, room_name: &str) -> String {
        format!("{}{room_name}", self.relay_channel_prefix)
    }

    /// Cache key of the snapshot written after a successful reconciliation.
    pub fn state_key(&self, map_id: &str) -> String {
        format!("{}state:{map_id}", self.cache_key_prefix)
    }

    /// Cache key of the snapshot written eagerly on every scheduled change.
    pub fn pending_key(&self, map_id: &str) -> String {
        format!("{}pending:{map_id}", self.cache_key_prefix)
    }
}
