//! TCP command server.
//!
//! One task per connection. Each connection is a strict FIFO: a request is
//! dispatched through the bridge and its reply written before the next
//! request is looked at, so replies come back in request order.
//!
//! ```text
//! Accepted → Reading → Dispatching → Writing → Reading ... → Closed
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};

use stagelink_codec::{encode_into, FrameDecoder};
use stagelink_host::{ScheduledTask, SchedulerBridge};

use crate::config::ServerConfig;
use crate::types::{Command, ErrorCode, ErrorInfo, Reply};
use crate::GatewayError;

/// Per-connection counters, logged on close.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub commands: u64,
    pub failures: u64,
}

/// Accept connections until `running` clears.
pub async fn run_tcp_server(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    bridge: SchedulerBridge,
    running: Arc<AtomicBool>,
) -> Result<(), GatewayError> {
    let limit = config.max_connections.map(|n| Arc::new(Semaphore::new(n)));
    let mut next_id = 0u64;

    while running.load(Ordering::Relaxed) {
        let (socket, peer) = match timeout(config.read_timeout, listener.accept()).await {
            Err(_) => continue,
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let permit = match limit.as_ref() {
            None => None,
            Some(sem) => match Arc::clone(sem).try_acquire_owned() {
                Ok(p) => Some(p),
                Err(_) => {
                    warn!(%peer, "connection limit reached, closing");
                    drop(socket);
                    continue;
                }
            },
        };

        next_id += 1;
        let conn_id = next_id;
        let _ = socket.set_nodelay(true);
        info!(conn = conn_id, %peer, "client connected");

        let config = Arc::clone(&config);
        let bridge = bridge.clone();
        let running = Arc::clone(&running);
        let span = info_span!("conn", id = conn_id, %peer);
        tokio::spawn(
            async move {
                match handle_connection(socket, peer, &config, &bridge, &running).await {
                    Ok(stats) => info!(
                        commands = stats.commands,
                        failures = stats.failures,
                        "client disconnected"
                    ),
                    Err(e) => warn!(error = %e, "connection closed with error"),
                }
                drop(permit);
            }
            .instrument(span),
        );
    }

    debug!("tcp accept loop stopped");
    Ok(())
}

/// Serve one connection until the peer closes, a frame is malformed, or
/// `running` clears.
pub async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    config: &ServerConfig,
    bridge: &SchedulerBridge,
    running: &AtomicBool,
) -> Result<ConnectionStats, GatewayError> {
    let (mut reader, mut writer) = socket.into_split();
    let mut decoder = FrameDecoder::with_max_frame(config.max_frame_bytes);
    let mut read_buf = vec![0u8; 8192];
    let mut out: Vec<u8> = Vec::with_capacity(4096);
    let mut stats = ConnectionStats::default();

    loop {
        loop {
            let command = match decoder.next_message::<Command>() {
                Ok(Some(c)) => c,
                Ok(None) => break,
                Err(e) => {
                    warn!(%peer, error = %e, "malformed frame, closing connection");
                    let reply =
                        Reply::failure(None, ErrorInfo::new(ErrorCode::Malformed, e.to_string()));
                    let _ = write_reply(&mut writer, &mut out, &reply).await;
                    return Ok(stats);
                }
            };

            stats.commands += 1;
            debug!(command = %command.name, id = ?command.id, "request");
            let Some(reply) = dispatch(bridge, command, config, running).await else {
                debug!("shutdown while waiting for host");
                return Ok(stats);
            };
            if !reply.is_success() {
                stats.failures += 1;
            }
            write_reply(&mut writer, &mut out, &reply).await?;
        }

        if !running.load(Ordering::Relaxed) {
            return Ok(stats);
        }

        let n = match timeout(config.read_timeout, reader.read(&mut read_buf)).await {
            Err(_) => continue,
            Ok(r) => r?,
        };
        if n == 0 {
            return Ok(stats);
        }
        decoder.extend(&read_buf[..n]);
    }
}

/// Hand one command to the host and wait for its reply.
///
/// Returns `None` only when the gateway is shutting down. A task whose sink
/// is dropped without a reply still yields a `host_unavailable` failure so the
/// client gets exactly one reply per request.
async fn dispatch(
    bridge: &SchedulerBridge,
    command: Command,
    config: &ServerConfig,
    running: &AtomicBool,
) -> Option<Reply> {
    let id = command.id;
    let (task, mut rx) = ScheduledTask::with_reply(command);
    bridge.submit(task);

    loop {
        match timeout(config.read_timeout, &mut rx).await {
            Ok(Ok(reply)) => return Some(reply),
            Ok(Err(_)) => {
                return Some(Reply::failure(
                    id,
                    ErrorInfo::new(ErrorCode::HostUnavailable, "host dropped the task"),
                ));
            }
            Err(_) => {
                if !running.load(Ordering::Relaxed) {
                    return None;
                }
            }
        }
    }
}

async fn write_reply(
    writer: &mut OwnedWriteHalf,
    buf: &mut Vec<u8>,
    reply: &Reply,
) -> Result<(), GatewayError> {
    encode_into(reply, buf)?;
    writer.write_all(buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Check whether `host:port` can be bound for TCP right now.
pub fn check_tcp_listen_available(host: &str, port: u16) -> std::io::Result<()> {
    let listener = std::net::TcpListener::bind((host, port))?;
    drop(listener);
    Ok(())
}
