//! Configuration for the lockstep demo node.

use std::path::Path;
use std::time::Duration;

use lockstep_core::SyncConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// What kind of session to run.
    pub session: SessionConfig,
    /// Synchronization timing and protocol settings.
    pub sync: SyncConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Which role the node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Local,
    Listen,
    Connect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub mode: Mode,
    /// Display name announced to peers.
    pub name: String,
    /// Rendezvous port in listen mode.
    pub port: u16,
    /// Listener address in connect mode.
    pub address: String,
    /// Tick rate.
    pub iterations_per_second: u32,
    /// Leave after this many ticks; run until Ctrl-C when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticks: Option<u64>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Local,
            name: "node".into(),
            port: 7777,
            address: "127.0.0.1:7777".into(),
            iterations_per_second: 25,
            ticks: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file.
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }
}

impl SessionConfig {
    /// Time between ticks; at least one tick per second.
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(1) / self.iterations_per_second.max(1)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&NodeConfig::default()).unwrap();
        assert!(text.contains("[session]"));
        assert!(text.contains("mode = \"local\""));
        assert!(text.contains("recv_timeout_ms"));
        assert!(!text.contains("ticks"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: NodeConfig = toml::from_str(
            "[session]\nmode = \"connect\"\naddress = \"10.0.0.2:9000\"\nticks = 50\n\n[sync]\nlatency = 3\n",
        )
        .unwrap();
        assert_eq!(cfg.session.mode, Mode::Connect);
        assert_eq!(cfg.session.ticks, Some(50));
        assert_eq!(cfg.session.iterations_per_second, 25);
        assert_eq!(cfg.sync.latency, 3);
        assert_eq!(cfg.sync.attempt_count, 10);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(toml::from_str::<NodeConfig>("[session]\nmode = \"relay\"\n").is_err());
    }

    #[test]
    fn tick_period_never_divides_by_zero() {
        let mut session = SessionConfig::default();
        assert_eq!(session.tick_period(), Duration::from_millis(40));
        session.iterations_per_second = 0;
        assert_eq!(session.tick_period(), Duration::from_secs(1));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = NodeConfig::load(Path::new("/nonexistent/lockstep-node.toml"));
        assert_eq!(cfg.session.port, 7777);
    }

    #[test]
    fn written_default_loads_back() {
        let path = std::env::temp_dir().join(format!("lockstep-node-{}.toml", std::process::id()));
        NodeConfig::write_default(&path).unwrap();
        let cfg = NodeConfig::load(&path);
        std::fs::remove_file(&path).ok();
        assert_eq!(cfg.session.mode, Mode::Local);
        assert_eq!(cfg.sync.max_packet_size, lockstep_core::MAX_PACKET_SIZE);
    }
}
