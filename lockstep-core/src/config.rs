//! Tunables for a synchronization session.
//!
//! Every field has a default, so a partial `[sync]` table in a TOML file
//! (or `SyncConfig { latency: 3, ..Default::default() }` in code) is
//! enough.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest datagram a socket will accept.
pub const MAX_PACKET_SIZE: usize = 32767;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Iterations between enqueuing an action and executing it.
    /// Hosting sessions always run at 0.
    pub latency: u64,

    /// Bounded wait for a peer's contribution before it joins the
    /// timeout group and its last packet is resent.
    pub recv_timeout_ms: u64,

    /// Wait for each handshake reply (welcome, port list).
    pub handshake_timeout_ms: u64,

    /// Handshake attempts before giving up.
    pub attempt_count: u32,

    /// How long a newly admitted peer waits for every existing host to
    /// connect back.
    pub admission_timeout_ms: u64,

    pub protocol_version: u32,

    pub max_packet_size: usize,

    /// Drop a host that stays in the timeout group this long.
    /// Unset means wait forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eviction_timeout_ms: Option<u64>,

    /// Copies of the goodbye frame sent on leave.
    pub goodbye_repeats: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            latency: 1,
            recv_timeout_ms: 500,
            handshake_timeout_ms: 500,
            attempt_count: 10,
            admission_timeout_ms: 60_000,
            protocol_version: PROTOCOL_VERSION,
            max_packet_size: MAX_PACKET_SIZE,
            eviction_timeout_ms: None,
            goodbye_repeats: 3,
        }
    }
}

impl SyncConfig {
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    pub fn eviction_timeout(&self) -> Option<Duration> {
        self.eviction_timeout_ms.map(Duration::from_millis)
    }
}
