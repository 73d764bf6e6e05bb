//! Server Configuration
//!
//! Loads configuration from environment variables.

use std::env;
use std::time::Duration;

use anyhow::{bail, Result};
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Default public STUN server used when `STUN_SERVERS` is not set.
const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port (env: `PORT`, default: 5005)
    pub port: u16,

    /// STUN server URLs (env: `STUN_SERVERS`, comma-separated)
    pub stun_servers: Vec<String>,

    /// Skip STUN entirely, e.g. when the SFU has a public IP
    /// (env: `DISABLE_STUN`)
    pub disable_stun: bool,

    /// Lower bound of the pinned UDP port range for ICE host candidates
    /// (env: `ICE_UDP_PORT_MIN`, 0 = unpinned)
    pub ice_udp_port_min: u16,

    /// Upper bound of the pinned UDP port range (env: `ICE_UDP_PORT_MAX`)
    pub ice_udp_port_max: u16,

    /// Rewrite host candidates to this IP for 1-to-1 NAT deployments
    /// (env: `ICE_ADVERTISE_IP`)
    pub ice_advertise_ip: Option<String>,

    /// Process-wide cap on concurrent peers. Defaults to the size of the
    /// pinned UDP port range so every accepted peer can bind a port
    /// (env: `MAX_PEERS`, 0 = unlimited)
    pub max_peers: usize,

    /// How often the idle sweeper runs (env: `ROOM_SWEEP_INTERVAL_SECS`,
    /// default: 300)
    pub sweep_interval: Duration,

    /// How long an empty room may idle before deletion
    /// (env: `ROOM_IDLE_SECS`, default: 1800)
    pub room_idle: Duration,

    /// Verbose component logging (env: `DEBUG`, default: true when unset)
    pub debug: bool,

    /// Periodic RTP forwarding counters (env: `VERBOSE_LOG`)
    pub verbose_log: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5005);

        let stun_servers = env::var("STUN_SERVERS")
            .ok()
            .map(|raw| parse_stun_servers(&raw))
            .filter(|servers| !servers.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_STUN_SERVER.into()]);

        let disable_stun = env_bool("DISABLE_STUN", false);

        let ice_udp_port_min = env::var("ICE_UDP_PORT_MIN")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let ice_udp_port_max = env::var("ICE_UDP_PORT_MAX")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if ice_udp_port_min > 0 && ice_udp_port_max < ice_udp_port_min {
            bail!(
                "ICE_UDP_PORT_MAX ({ice_udp_port_max}) must be >= ICE_UDP_PORT_MIN ({ice_udp_port_min})"
            );
        }

        let max_peers = env::var("MAX_PEERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok(Self {
            port,
            stun_servers,
            disable_stun,
            ice_udp_port_min,
            ice_udp_port_max,
            ice_advertise_ip: env::var("ICE_ADVERTISE_IP").ok().filter(|v| !v.is_empty()),
            max_peers: derive_max_peers(max_peers, ice_udp_port_min, ice_udp_port_max),
            sweep_interval: Duration::from_secs(
                env::var("ROOM_SWEEP_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            ),
            room_idle: Duration::from_secs(
                env::var("ROOM_IDLE_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1800),
            ),
            debug: env_bool("DEBUG", true),
            verbose_log: env_bool("VERBOSE_LOG", false),
        })
    }

    /// ICE servers handed to every new peer connection.
    #[must_use]
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        if self.disable_stun {
            return Vec::new();
        }
        vec![RTCIceServer {
            urls: self.stun_servers.clone(),
            ..Default::default()
        }]
    }

    /// Whether a UDP port range is pinned for ICE host candidates.
    #[must_use]
    pub const fn has_udp_port_range(&self) -> bool {
        self.ice_udp_port_min > 0 && self.ice_udp_port_max >= self.ice_udp_port_min
    }

    /// Create a default configuration for testing.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            port: 0,
            stun_servers: vec![DEFAULT_STUN_SERVER.into()],
            disable_stun: true,
            ice_udp_port_min: 0,
            ice_udp_port_max: 0,
            ice_advertise_ip: None,
            max_peers: 0,
            sweep_interval: Duration::from_secs(300),
            room_idle: Duration::from_secs(1800),
            debug: false,
            verbose_log: false,
        }
    }
}

/// Split a comma-separated STUN server list, dropping empty entries.
fn parse_stun_servers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Cap defaults to the size of the pinned UDP range so that every accepted
/// peer can bind a host candidate.
fn derive_max_peers(explicit: usize, port_min: u16, port_max: u16) -> usize {
    if explicit > 0 {
        return explicit;
    }
    if port_min > 0 && port_max >= port_min {
        return usize::from(port_max - port_min) + 1;
    }
    0
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| v.to_lowercase() == "true" || v == "1")
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stun_list_splits_and_trims() {
        let servers = parse_stun_servers("stun:a.example:3478, stun:b.example:3478 ,");
        assert_eq!(servers, vec!["stun:a.example:3478", "stun:b.example:3478"]);
    }

    #[test]
    fn max_peers_defaults_to_udp_range_size() {
        assert_eq!(derive_max_peers(0, 50000, 50009), 10);
        assert_eq!(derive_max_peers(0, 0, 0), 0);
        // Explicit value wins over the derived one.
        assert_eq!(derive_max_peers(3, 50000, 50009), 3);
    }

    #[test]
    fn disable_stun_empties_ice_servers() {
        let mut config = Config::default_for_test();
        config.disable_stun = true;
        assert!(config.ice_servers().is_empty());

        config.disable_stun = false;
        let servers = config.ice_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec![DEFAULT_STUN_SERVER.to_string()]);
    }
}
