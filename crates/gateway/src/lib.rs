//! Gateway module - dual-channel network front end for a single-threaded host
//!
//! External clients drive the host through two channels:
//!
//! - **TCP** (default `127.0.0.1:9877`): newline-delimited JSON request/response.
//!   Exactly one reply per request, in request order, even when a handler
//!   fails or panics.
//! - **UDP** (default `127.0.0.1:9878`): one JSON command per datagram,
//!   fire-and-forget, for high-rate parameter streams. Never answered.
//!
//! Neither channel runs handlers on a network thread. Both submit
//! [`ScheduledTask`](stagelink_host::ScheduledTask)s to a
//! [`SchedulerBridge`], which the host drains from its own execution context.
//!
//! # Environment Variables
//!
//! See [`ServerConfig::from_env`]. `STAGELINK_DISABLED=1` turns the gateway
//! off entirely ([`Gateway::start_from_env`] returns `None`).
//!
//! # Example Protocol Flow
//!
//! ```text
//! TCP  Client -> Host: {"type":"ping","params":{},"id":1}
//! TCP  Host -> Client: {"status":"success","result":{"pong":true},"id":1}
//! TCP  Client -> Host: {"type":"nope","params":{},"id":2}
//! TCP  Host -> Client: {"status":"error","message":"unknown command: nope","code":"unknown_command","id":2}
//! UDP  Client -> Host: {"type":"batch_set_device_parameters","params":{"track_index":0,"device_index":0,"parameter_indices":[0,1],"values":[0.25,0.8]}}
//! ```
//!
//! # Testing
//!
//! ```bash
//! nc 127.0.0.1 9877
//! {"type":"ping"}
//! ```

pub mod config;
pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use stagelink_host::SchedulerBridge;

pub use stagelink_host as host;
pub use stagelink_types as types;

pub use config::ServerConfig;
pub use tcp::{check_tcp_listen_available, handle_connection, run_tcp_server, ConnectionStats};
pub use udp::{run_udp_server, DatagramStats};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to bind {proto} {addr}: {source}")]
    Bind {
        proto: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Bound but not yet running gateway.
pub struct Gateway {
    config: Arc<ServerConfig>,
    listener: TcpListener,
    udp: UdpSocket,
}

impl Gateway {
    /// Bind both sockets. Port 0 picks an ephemeral port.
    pub async fn bind(config: ServerConfig) -> Result<Self, GatewayError> {
        let host = config.host.as_str();
        let listener = TcpListener::bind((host, config.tcp_port))
            .await
            .map_err(|source| GatewayError::Bind {
                proto: "tcp",
                addr: format!("{}:{}", host, config.tcp_port),
                source,
            })?;
        let udp = UdpSocket::bind((host, config.udp_port))
            .await
            .map_err(|source| GatewayError::Bind {
                proto: "udp",
                addr: format!("{}:{}", host, config.udp_port),
                source,
            })?;

        Ok(Self {
            config: Arc::new(config),
            listener,
            udp,
        })
    }

    pub fn tcp_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn udp_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.udp.local_addr()?)
    }

    /// Serve both channels until `running` clears.
    pub async fn run(
        self,
        bridge: SchedulerBridge,
        running: Arc<AtomicBool>,
    ) -> Result<(), GatewayError> {
        info!(
            tcp = %self.tcp_addr()?,
            udp = %self.udp_addr()?,
            degraded = bridge.is_degraded(),
            "gateway listening"
        );

        let tcp = tokio::spawn(run_tcp_server(
            self.listener,
            Arc::clone(&self.config),
            bridge.clone(),
            Arc::clone(&running),
        ));
        let udp = tokio::spawn(run_udp_server(
            self.udp,
            Arc::clone(&self.config),
            bridge,
            Arc::clone(&running),
        ));

        let (tcp, udp) = tokio::join!(tcp, udp);
        tcp??;
        udp??;
        info!("gateway stopped");
        Ok(())
    }

    /// Bind and run on a runtime owned by the returned handle.
    ///
    /// Must be called from outside any tokio runtime.
    pub fn start(config: ServerConfig, bridge: SchedulerBridge) -> Result<GatewayHandle, GatewayError> {
        let rt = Runtime::new()?;
        let read_timeout = config.read_timeout;
        let gateway = rt.block_on(Gateway::bind(config))?;
        let tcp_addr = gateway.tcp_addr()?;
        let udp_addr = gateway.udp_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let task = rt.spawn(gateway.run(bridge, Arc::clone(&running)));

        Ok(GatewayHandle {
            rt: Some(rt),
            task: Some(task),
            tcp_addr,
            udp_addr,
            running,
            read_timeout,
        })
    }

    /// Start from environment variables.
    ///
    /// Returns `Ok(None)` if `STAGELINK_DISABLED` is set.
    pub fn start_from_env(bridge: SchedulerBridge) -> Result<Option<GatewayHandle>, GatewayError> {
        if ServerConfig::is_disabled() {
            info!("gateway disabled (STAGELINK_DISABLED)");
            return Ok(None);
        }
        Self::start(ServerConfig::from_env(), bridge).map(Some)
    }
}

/// Running gateway instance.
pub struct GatewayHandle {
    rt: Option<Runtime>,
    task: Option<JoinHandle<Result<(), GatewayError>>>,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    running: Arc<AtomicBool>,
    read_timeout: Duration,
}

impl GatewayHandle {
    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop both loops and wait (bounded) for them to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        let Some(rt) = self.rt.take() else {
            return;
        };
        if let Some(task) = self.task.take() {
            let grace = self.read_timeout * 2 + Duration::from_millis(100);
            match rt.block_on(async { tokio::time::timeout(grace, task).await }) {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(error = %e, "gateway exited with error"),
                Ok(Err(e)) => warn!(error = %e, "gateway task failed"),
                Err(_) => warn!("gateway did not stop in time"),
            }
        }
        rt.shutdown_timeout(Duration::from_millis(500));
    }
}

impl Drop for GatewayHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
