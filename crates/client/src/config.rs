//! Client configuration.

use std::str::FromStr;
use std::time::Duration;

use crate::types::{DEFAULT_HOST, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT, PING_COMMAND};

/// How the throttle groups changed axes into datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    /// One datagram per changed axis.
    Individual,
    /// One datagram for all changed axes.
    #[default]
    Batched,
}

impl FromStr for StreamMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("individual") {
            Ok(Self::Individual)
        } else if s.eq_ignore_ascii_case("batch") || s.eq_ignore_ascii_case("batched") {
            Ok(Self::Batched)
        } else {
            Err(format!("unknown stream mode: {}", s))
        }
    }
}

/// Retry backoff: `initial * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(2),
        }
    }
}

impl Backoff {
    /// Fixed delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Throttle tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamConfig {
    pub min_interval: Duration,
    pub change_threshold: f64,
    pub mode: StreamMode,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(20),
            change_threshold: 0.002,
            mode: StreamMode::Batched,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub connect_timeout: Duration,
    /// Per-call deadline used by [`call`](crate::ClientSession::call).
    pub call_timeout: Duration,
    /// Deadline for the verification call made by `connect()` and the health probe.
    pub probe_timeout: Duration,
    pub max_retries: u32,
    pub backoff: Backoff,
    pub probe_command: String,
    pub health_interval: Duration,
    /// Consecutive failures that force a reconnect.
    pub failure_threshold: u32,
    /// Age of the last successful call that forces a reconnect.
    pub stale_after: Duration,
    pub max_frame_bytes: usize,
    pub stream: StreamConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_UDP_PORT,
            connect_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            max_retries: 3,
            backoff: Backoff::default(),
            probe_command: PING_COMMAND.to_string(),
            health_interval: Duration::from_secs(5),
            failure_threshold: 3,
            stale_after: Duration::from_secs(10),
            max_frame_bytes: stagelink_codec::DEFAULT_MAX_FRAME_BYTES,
            stream: StreamConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create from environment variables.
    ///
    /// - `STAGELINK_HOST`, `STAGELINK_TCP_PORT`, `STAGELINK_UDP_PORT`
    /// - `STAGELINK_CALL_TIMEOUT_MS`, `STAGELINK_MAX_RETRIES`
    /// - `STAGELINK_BACKOFF_MS`, `STAGELINK_BACKOFF_MAX_MS`
    /// - `STAGELINK_HEALTH_INTERVAL_MS`
    /// - `STAGELINK_STREAM_INTERVAL_MS`, `STAGELINK_STREAM_THRESHOLD`,
    ///   `STAGELINK_STREAM_MODE` (`batch` | `individual`)
    pub fn from_env() -> Self {
        let d = Self::default();

        let host = std::env::var("STAGELINK_HOST")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(d.host);

        let backoff_initial = env_ms("STAGELINK_BACKOFF_MS").unwrap_or(d.backoff.initial);
        let backoff_max = env_ms("STAGELINK_BACKOFF_MAX_MS")
            .unwrap_or(d.backoff.max)
            .max(backoff_initial);

        let stream = StreamConfig {
            min_interval: env_ms("STAGELINK_STREAM_INTERVAL_MS").unwrap_or(d.stream.min_interval),
            change_threshold: env_parse::<f64>("STAGELINK_STREAM_THRESHOLD")
                .filter(|t| t.is_finite() && *t >= 0.0)
                .unwrap_or(d.stream.change_threshold),
            mode: std::env::var("STAGELINK_STREAM_MODE")
                .ok()
                .and_then(|s| s.trim().parse::<StreamMode>().ok())
                .unwrap_or(d.stream.mode),
        };

        Self {
            host,
            tcp_port: env_parse("STAGELINK_TCP_PORT").unwrap_or(d.tcp_port),
            udp_port: env_parse("STAGELINK_UDP_PORT").unwrap_or(d.udp_port),
            call_timeout: env_ms("STAGELINK_CALL_TIMEOUT_MS").unwrap_or(d.call_timeout),
            max_retries: env_parse("STAGELINK_MAX_RETRIES").unwrap_or(d.max_retries),
            backoff: Backoff {
                initial: backoff_initial,
                max: backoff_max,
            },
            health_interval: env_ms("STAGELINK_HEALTH_INTERVAL_MS").unwrap_or(d.health_interval),
            stream,
            ..d
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_ms(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
