//! Core configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Quiet period before a counter's buffered edits are flushed, in
    /// milliseconds. Further edits within the window restart it.
    #[serde(default = "default_flush_quiet_ms")]
    pub flush_quiet_ms: u64,

    /// Heartbeats older than this are treated as inactive when deciding
    /// claims, regardless of the stored `is_active` flag.
    #[serde(default = "default_heartbeat_ttl_secs")]
    pub heartbeat_ttl_secs: u64,

    /// Capacity of the per-record snapshot broadcast channel.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl CoreConfig {
    pub fn flush_quiet_period(&self) -> Duration {
        Duration::from_millis(self.flush_quiet_ms)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    /// Owners refresh their heartbeat well inside the TTL so an active
    /// editor never looks stale to other claimants.
    pub fn heartbeat_refresh_interval(&self) -> Duration {
        Duration::from_secs((self.heartbeat_ttl_secs / 3).max(1))
    }
}

// Defaults
fn default_flush_quiet_ms() -> u64 { 600 }
fn default_heartbeat_ttl_secs() -> u64 { 45 }
fn default_broadcast_capacity() -> usize { 64 }

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            flush_quiet_ms: default_flush_quiet_ms(),
            heartbeat_ttl_secs: default_heartbeat_ttl_secs(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}
