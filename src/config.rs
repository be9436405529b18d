use std::time::Duration;

use serde::Deserialize;

/// Runtime configuration, loaded from `IRONBUS_`-prefixed environment
/// variables. Every field has a default suitable for a single-node
/// deployment with an on-disk SQLite store.
#[derive(Clone, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,

    /// Non-zero identity of this node. Owner id 0 is reserved to mean
    /// "unowned / any node".
    pub node_id: Option<u32>,

    pub scheduled_poll_ms: Option<u64>,
    pub recovery_poll_ms: Option<u64>,
    pub expiry_poll_ms: Option<u64>,
    pub heartbeat_ms: Option<u64>,

    /// How long an owned incoming envelope may go untouched before any
    /// node may reclaim it.
    pub staleness_ms: Option<u64>,

    /// How long a node may miss heartbeats before its work is reassigned.
    pub node_timeout_ms: Option<u64>,

    /// Retention for handled incoming envelopes.
    pub handled_retention_ms: Option<u64>,

    /// Optional retention horizon for dead letters. `None` keeps them
    /// until replayed or cleared.
    pub dead_letter_retention_ms: Option<u64>,

    pub recovery_batch_size: Option<u32>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("IRONBUS_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> Option<&str> {
        self.db_path.as_deref()
    }

    pub fn node_id(&self) -> u32 {
        self.node_id.unwrap_or(1).max(1)
    }

    pub fn scheduled_poll_interval(&self) -> Duration {
        Duration::from_millis(self.scheduled_poll_ms.unwrap_or(1_000))
    }

    pub fn recovery_poll_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_poll_ms.unwrap_or(2_000))
    }

    pub fn expiry_poll_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_poll_ms.unwrap_or(60_000))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.unwrap_or(5_000))
    }

    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.staleness_ms.unwrap_or(300_000) as i64)
    }

    pub fn node_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.node_timeout_ms.unwrap_or(30_000) as i64)
    }

    pub fn handled_retention(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.handled_retention_ms.unwrap_or(1_209_600_000) as i64)
    }

    pub fn dead_letter_retention(&self) -> Option<chrono::Duration> {
        self.dead_letter_retention_ms
            .map(|ms| chrono::Duration::milliseconds(ms as i64))
    }

    pub fn recovery_batch_size(&self) -> u32 {
        self.recovery_batch_size.unwrap_or(100)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            node_id: None,
            scheduled_poll_ms: None,
            recovery_poll_ms: None,
            expiry_poll_ms: None,
            heartbeat_ms: None,
            staleness_ms: None,
            node_timeout_ms: None,
            handled_retention_ms: None,
            dead_letter_retention_ms: None,
            recovery_batch_size: None,
        }
    }
}
