//! Gateway configuration.

use std::time::Duration;

use stagelink_codec::DEFAULT_MAX_FRAME_BYTES;

use crate::types::{DEFAULT_HOST, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT, MAX_DATAGRAM_BYTES};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub tcp_port: u16,
    pub udp_port: u16,
    /// `None` = bounded only by the OS.
    pub max_connections: Option<usize>,
    /// Liveness tick for blocking reads. Idle connections are never failed
    /// because of it; loops only use it to notice shutdown.
    pub read_timeout: Duration,
    pub max_frame_bytes: usize,
    pub max_datagram_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_UDP_PORT,
            max_connections: None,
            read_timeout: Duration::from_millis(1000),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_datagram_bytes: MAX_DATAGRAM_BYTES,
        }
    }
}

impl ServerConfig {
    /// Create from environment variables, falling back to defaults for
    /// anything unset or unparsable.
    ///
    /// - `STAGELINK_HOST`
    /// - `STAGELINK_TCP_PORT`, `STAGELINK_UDP_PORT`
    /// - `STAGELINK_MAX_CONNECTIONS` (0 or unset = unlimited)
    /// - `STAGELINK_READ_TIMEOUT_MS`
    /// - `STAGELINK_MAX_FRAME_BYTES`
    pub fn from_env() -> Self {
        use std::env;

        let defaults = Self::default();

        let host = env::var("STAGELINK_HOST")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.host);

        Self {
            host,
            tcp_port: env_parse("STAGELINK_TCP_PORT").unwrap_or(defaults.tcp_port),
            udp_port: env_parse("STAGELINK_UDP_PORT").unwrap_or(defaults.udp_port),
            max_connections: env_parse::<usize>("STAGELINK_MAX_CONNECTIONS").filter(|&n| n > 0),
            read_timeout: env_parse("STAGELINK_READ_TIMEOUT_MS")
                .filter(|&ms: &u64| ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.read_timeout),
            max_frame_bytes: env_parse("STAGELINK_MAX_FRAME_BYTES")
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.max_frame_bytes),
            max_datagram_bytes: defaults.max_datagram_bytes,
        }
    }

    /// Check if the gateway is disabled via environment
    pub fn is_disabled() -> bool {
        std::env::var("STAGELINK_DISABLED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}
