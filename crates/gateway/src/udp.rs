//! UDP telemetry server.
//!
//! Every datagram is one self-contained command. The loop only decodes and
//! forwards to the bridge; it never runs a handler itself (except in the
//! bridge's degraded mode) and never answers. Bad datagrams are logged and
//! dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use stagelink_codec::decode_datagram;
use stagelink_host::{ScheduledTask, SchedulerBridge};

use crate::config::ServerConfig;
use crate::types::Command;
use crate::GatewayError;

/// Receive-loop counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DatagramStats {
    pub received: u64,
    pub forwarded: u64,
    pub dropped: u64,
}

/// Receive datagrams until `running` clears.
pub async fn run_udp_server(
    socket: UdpSocket,
    config: Arc<ServerConfig>,
    bridge: SchedulerBridge,
    running: Arc<AtomicBool>,
) -> Result<DatagramStats, GatewayError> {
    let mut buf = vec![0u8; config.max_datagram_bytes.max(1)];
    let mut stats = DatagramStats::default();

    while running.load(Ordering::Relaxed) {
        let (n, peer) = match timeout(config.read_timeout, socket.recv_from(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                // ICMP port-unreachable from an earlier send can surface here on
                // some platforms; it says nothing about this socket's health.
                warn!(error = %e, "udp receive failed");
                continue;
            }
        };
        stats.received += 1;

        match decode_datagram::<Command>(&buf[..n]) {
            Ok(command) => {
                trace!(%peer, command = %command.name, "datagram");
                bridge.submit(ScheduledTask::fire_and_forget(command));
                stats.forwarded += 1;
            }
            Err(e) => {
                stats.dropped += 1;
                warn!(%peer, bytes = n, error = %e, "dropping malformed datagram");
            }
        }
    }

    debug!(
        received = stats.received,
        forwarded = stats.forwarded,
        dropped = stats.dropped,
        "udp receive loop stopped"
    );
    Ok(stats)
}
