//! Crate-wide configuration. A plain, `Default`-constructible value passed
//! once at construction — never global mutable state.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Per-attempt connect timeout.
    pub timeout_ms: u64,
    /// Relay endpoints to try during fallback.
    pub max_retries: u32,
    /// Heartbeat period for connected peers.
    pub heartbeat_interval_ms: u64,
    /// Enables the optional obfuscation traffic layer.
    pub enable_obfuscation: bool,
    /// ICE server list for the direct transport.
    pub rtc_config: Vec<String>,
    /// Ordered relay endpoints used for fallback.
    pub relay_servers: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 3,
            heartbeat_interval_ms: 30_000,
            enable_obfuscation: false,
            rtc_config: Vec::new(),
            relay_servers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Default broadcast hop cap.
    pub max_hops: u32,
    /// Propagation tick period.
    pub interval_ms: u64,
    /// Default broadcast TTL.
    pub message_ttl_ms: u64,
    /// If false, enqueued broadcasts are never propagated.
    pub enable_auto_propagation: bool,
    /// Messages drained from the gossip queue per tick.
    pub max_concurrent_gossip: usize,
    /// Gossip queue capacity; excess entries drop the oldest.
    pub queue_capacity: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            max_hops: 10,
            interval_ms: 5_000,
            message_ttl_ms: 300_000,
            enable_auto_propagation: true,
            max_concurrent_gossip: 5,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub gossip: GossipConfig,
    /// Peer table cap.
    pub max_connections: usize,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            gossip: GossipConfig::default(),
            max_connections: 50,
            debug: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults for any
    /// field the file omits.
    pub fn from_toml_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.connection.timeout_ms, 30_000);
        assert_eq!(cfg.gossip.max_hops, 10);
        assert_eq!(cfg.gossip.interval_ms, 5_000);
        assert_eq!(cfg.max_connections, 50);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let cfg: Config = toml::from_str("debug = true\n[gossip]\nmax_hops = 3\n").unwrap();
        assert!(cfg.debug);
        assert_eq!(cfg.gossip.max_hops, 3);
        assert_eq!(cfg.gossip.interval_ms, 5_000);
    }
}
