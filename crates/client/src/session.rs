//! Connection manager for the host's TCP command channel and UDP stream.
//!
//! One [`ClientSession`] owns at most one TCP connection. Calls are
//! serialized: a call holds the session until its reply arrives, times out,
//! or the retries run out. Replies are matched by id, so a late reply to an
//! abandoned call is discarded instead of being handed to the next caller.
//!
//! Do not call into a session from the host's own execution context: the
//! reply can only be produced once that context is free again.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use stagelink_codec::{encode, FrameDecoder};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::types::{Command, Params, Reply};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// The last connect attempt failed.
    Error,
}

/// Snapshot returned by [`ClientSession::status`].
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub consecutive_failures: u32,
    /// Time since the last successful round trip.
    pub since_success: Option<Duration>,
    pub calls: u64,
    pub datagrams_sent: u64,
    pub stream_ready: bool,
}

struct Connection {
    writer: OwnedWriteHalf,
    replies: mpsc::Receiver<Reply>,
    reader: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// The call currently waiting on the connection.
struct PendingCall {
    id: u64,
    command: String,
    timeout: Duration,
    deadline: Instant,
}

impl PendingCall {
    fn timed_out(&self) -> ClientError {
        ClientError::Timeout {
            command: self.command.clone(),
            timeout: self.timeout,
        }
    }
}

struct Inner {
    conn: Option<Connection>,
    state: ConnectionState,
    last_success: Option<Instant>,
    consecutive_failures: u32,
    next_id: u64,
    calls: u64,
}

impl Inner {
    fn drop_connection(&mut self, state: ConnectionState) {
        self.conn = None;
        self.state = state;
    }

    fn mark_success(&mut self) {
        self.last_success = Some(Instant::now());
        self.consecutive_failures = 0;
    }
}

struct Stream {
    socket: UdpSocket,
    target: SocketAddr,
}

/// Cheaply cloneable handle to one logical connection.
#[derive(Clone)]
pub struct ClientSession {
    config: Arc<ClientConfig>,
    inner: Arc<Mutex<Inner>>,
    stream: Arc<StdMutex<Option<Arc<Stream>>>>,
    datagrams: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl ClientSession {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(Inner {
                conn: None,
                state: ConnectionState::Disconnected,
                last_success: None,
                consecutive_failures: 0,
                next_id: 0,
                calls: 0,
            })),
            stream: Arc::new(StdMutex::new(None)),
            datagrams: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_env() -> Self {
        Self::new(ClientConfig::from_env())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open the TCP connection, verify it with one probe call, and set up the
    /// UDP stream socket. A no-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        self.closed.store(false, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock().await;
            if inner.conn.is_none() {
                self.open(&mut inner, ConnectionState::Connecting).await?;
            }
        }
        self.init_stream().await
    }

    /// Set up the UDP socket without touching TCP.
    pub async fn init_stream(&self) -> Result<()> {
        if self.current_stream().is_some() {
            return Ok(());
        }
        let target = resolve(&self.config.host, self.config.udp_port).await?;
        let local: SocketAddr = if target.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        // `try_send_to` reports WouldBlock until the reactor has seen the
        // socket become writable once.
        socket.writable().await?;

        let mut slot = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            debug!(%target, "udp stream ready");
            *slot = Some(Arc::new(Stream { socket, target }));
        }
        Ok(())
    }

    fn current_stream(&self) -> Option<Arc<Stream>> {
        self.stream
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// [`call_and_wait`](Self::call_and_wait) with the configured timeout and
    /// retry count.
    pub async fn call(&self, name: &str, params: Params) -> Result<Params> {
        self.call_and_wait(
            Command::new(name, params),
            self.config.call_timeout,
            self.config.max_retries,
        )
        .await
    }

    /// Send one command and wait for its correlated reply.
    ///
    /// Transport failures and timeouts drop the connection, back off, and
    /// retry on a fresh connection up to `max_retries` times. A failure
    /// reported by the host is returned as [`ClientError::Remote`] without
    /// retrying.
    pub async fn call_and_wait(
        &self,
        command: Command,
        call_timeout: Duration,
        max_retries: u32,
    ) -> Result<Params> {
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        let mut attempt = 0u32;

        loop {
            let outcome = if inner.conn.is_some() {
                Ok(())
            } else {
                self.open(&mut inner, ConnectionState::Reconnecting).await
            };
            let outcome = match outcome {
                Ok(()) => self.round_trip(&mut inner, &command, call_timeout).await,
                Err(e) => Err(e),
            };

            let err = match outcome {
                Ok(reply) => {
                    inner.mark_success();
                    return reply.into_result().map_err(|error| ClientError::Remote {
                        command: command.name.clone(),
                        error,
                    });
                }
                Err(e) => e,
            };

            inner.consecutive_failures += 1;
            if err.is_retryable() {
                inner.drop_connection(ConnectionState::Reconnecting);
            }
            if !err.is_retryable() || attempt >= max_retries {
                if inner.conn.is_none() {
                    inner.state = ConnectionState::Error;
                }
                warn!(command = %command.name, attempts = attempt + 1, error = %err, "call failed");
                return Err(err);
            }

            let delay = self.config.backoff.delay(attempt);
            attempt += 1;
            debug!(
                command = %command.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Fire-and-forget over UDP. Returns whether the datagram left the socket;
    /// delivery is never confirmed.
    pub fn send_stream(&self, command: &Command) -> bool {
        let Some(stream) = self.current_stream() else {
            trace!(command = %command.name, "stream not initialized");
            return false;
        };
        let bytes = match encode(command) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to encode datagram");
                return false;
            }
        };
        match stream.socket.try_send_to(&bytes, stream.target) {
            Ok(_) => {
                self.datagrams.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                trace!(error = %e, "datagram not sent");
                false
            }
        }
    }

    /// Probe the connection once, reconnecting if it is down, has failed
    /// `failure_threshold` probes in a row, or has not succeeded for
    /// `stale_after`. Returns whether the session is healthy afterwards.
    pub async fn health_check(&self) -> bool {
        let mut inner = self.inner.lock().await;

        if inner.conn.is_some() {
            let probe = Command::new(self.config.probe_command.as_str(), Params::new());
            match self.round_trip(&mut inner, &probe, self.config.probe_timeout).await {
                Ok(_) => {
                    inner.mark_success();
                    return true;
                }
                Err(e) => {
                    inner.consecutive_failures += 1;
                    debug!(error = %e, failures = inner.consecutive_failures, "health probe failed");
                    if e.is_transport() {
                        inner.drop_connection(ConnectionState::Reconnecting);
                    }
                }
            }
        }

        let stale = inner
            .last_success
            .map_or(true, |t| t.elapsed() > self.config.stale_after);
        let must_reconnect = inner.conn.is_none()
            || inner.consecutive_failures >= self.config.failure_threshold
            || stale;
        if !must_reconnect {
            return false;
        }

        info!(failures = inner.consecutive_failures, stale, "reconnecting");
        inner.drop_connection(ConnectionState::Reconnecting);
        match self.open(&mut inner, ConnectionState::Reconnecting).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "reconnect failed");
                false
            }
        }
    }

    /// Run [`health_check`](Self::health_check) every `health_interval` until
    /// [`close`](Self::close) is called.
    pub fn spawn_health_check(&self) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(session.config.health_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if session.closed.load(Ordering::Relaxed) {
                    break;
                }
                session.health_check().await;
            }
            debug!("health check stopped");
        })
    }

    pub async fn status(&self) -> SessionStatus {
        let inner = self.inner.lock().await;
        SessionStatus {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            since_success: inner.last_success.map(|t| t.elapsed()),
            calls: inner.calls,
            datagrams_sent: self.datagrams.load(Ordering::Relaxed),
            stream_ready: self.current_stream().is_some(),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.conn.is_some()
    }

    /// Drop both sockets and stop the health check.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.stream.lock().unwrap_or_else(|e| e.into_inner()).take();
        let mut inner = self.inner.lock().await;
        if inner.conn.is_some() {
            info!("session closed");
        }
        inner.drop_connection(ConnectionState::Disconnected);
    }

    async fn open(&self, inner: &mut Inner, state: ConnectionState) -> Result<()> {
        inner.state = state;
        let addr = (self.config.host.as_str(), self.config.tcp_port);
        let socket = match timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                inner.state = ConnectionState::Error;
                return Err(e.into());
            }
            Err(_) => {
                inner.state = ConnectionState::Error;
                return Err(ClientError::Timeout {
                    command: "connect".to_string(),
                    timeout: self.config.connect_timeout,
                });
            }
        };
        let _ = socket.set_nodelay(true);
        let peer = socket.peer_addr()?;

        let (reader, writer) = socket.into_split();
        let (tx, replies) = mpsc::channel(64);
        let reader = tokio::spawn(read_replies(reader, tx, self.config.max_frame_bytes));
        inner.conn = Some(Connection {
            writer,
            replies,
            reader,
        });

        let probe = Command::new(self.config.probe_command.as_str(), Params::new());
        match self.round_trip(inner, &probe, self.config.probe_timeout).await {
            Ok(_) => {
                inner.state = ConnectionState::Connected;
                inner.mark_success();
                info!(%peer, "connected");
                Ok(())
            }
            Err(e) => {
                inner.drop_connection(ConnectionState::Error);
                Err(e)
            }
        }
    }

    async fn round_trip(
        &self,
        inner: &mut Inner,
        command: &Command,
        call_timeout: Duration,
    ) -> Result<Reply> {
        inner.next_id += 1;
        let pending = PendingCall {
            id: inner.next_id,
            command: command.name.clone(),
            timeout: call_timeout,
            deadline: Instant::now() + call_timeout,
        };
        let conn = inner.conn.as_mut().ok_or(ClientError::Disconnected)?;

        let framed = Command {
            id: Some(pending.id),
            ..command.clone()
        };
        let bytes = encode(&framed)?;
        match timeout_at(pending.deadline, conn.writer.write_all(&bytes)).await {
            Ok(r) => r?,
            Err(_) => return Err(pending.timed_out()),
        }
        trace!(command = %pending.command, id = pending.id, "sent");

        loop {
            let reply = match timeout_at(pending.deadline, conn.replies.recv()).await {
                Err(_) => return Err(pending.timed_out()),
                Ok(None) => return Err(ClientError::Disconnected),
                Ok(Some(reply)) => reply,
            };
            match reply.id {
                Some(id) if id == pending.id => return Ok(reply),
                // Peers that do not echo ids answer strictly in order.
                None => return Ok(reply),
                Some(id) => debug!(id, expected = pending.id, "discarding stale reply"),
            }
        }
    }
}

async fn read_replies(mut reader: OwnedReadHalf, tx: mpsc::Sender<Reply>, max_frame_bytes: usize) {
    let mut decoder = FrameDecoder::with_max_frame(max_frame_bytes);
    let mut buf = vec![0u8; 8192];
    loop {
        loop {
            match decoder.next_message::<Reply>() {
                Ok(Some(reply)) => {
                    if tx.send(reply).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "undecodable reply, dropping connection");
                    return;
                }
            }
        }
        match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => decoder.extend(&buf[..n]),
            Err(e) => {
                debug!(error = %e, "read failed");
                return;
            }
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| ClientError::Resolve(format!("{}:{}", host, port)))
}
