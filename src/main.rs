//! Demo host (default binary).
//!
//! Serves an in-memory live set over the gateway. The main thread plays the
//! host's execution context: it owns the [`HostLoop`] and pumps it once per
//! tick, so every command mutates the model on this thread only.
//!
//! Besides the gateway's `STAGELINK_*` variables:
//!
//! - `STAGELINK_TICK_MS`: host tick (default 10)
//! - `STAGELINK_DEGRADED=1`: run without a host loop, executing commands
//!   inline on the network threads
//! - `RUST_LOG`: log filter (default `stagelink=info`)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stagelink::gateway::{check_tcp_listen_available, Gateway, ServerConfig};
use stagelink::host::{Dispatcher, HostLoop, SchedulerBridge, SharedExecutor};
use stagelink::live_set::{self, LiveSet};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stagelink=info")),
        )
        .init();

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))
        .context("failed to install Ctrl-C handler")?;

    let dispatcher = Dispatcher::new(live_set::command_table(), LiveSet::demo()).shared();
    let executor: SharedExecutor = dispatcher.clone();

    let degraded = std::env::var("STAGELINK_DEGRADED").is_ok_and(|v| v == "1");
    let (bridge, host) = if degraded {
        (SchedulerBridge::degraded(executor), None)
    } else {
        let (bridge, host) = SchedulerBridge::attached(executor);
        (bridge, Some(host))
    };

    if !ServerConfig::is_disabled() {
        let config = ServerConfig::from_env();
        check_tcp_listen_available(&config.host, config.tcp_port).with_context(|| {
            format!(
                "tcp port {}:{} is taken; is another host already running?",
                config.host, config.tcp_port
            )
        })?;
    }

    let Some(gateway) = Gateway::start_from_env(bridge).context("failed to start gateway")? else {
        return Ok(());
    };
    info!(
        tcp = %gateway.tcp_addr(),
        udp = %gateway.udp_addr(),
        degraded,
        "host ready, Ctrl-C to stop"
    );

    let tick = std::env::var("STAGELINK_TICK_MS")
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|&ms| ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(10));
    run(host, &running, tick);

    gateway.shutdown();

    let d = dispatcher.lock().unwrap_or_else(|e| e.into_inner());
    info!(
        executed = d.executed(),
        failed = d.failed(),
        tempo = d.state().tempo,
        "host stopped"
    );
    Ok(())
}

fn run(mut host: Option<HostLoop>, running: &AtomicBool, tick: Duration) {
    while running.load(Ordering::SeqCst) {
        if let Some(host) = host.as_mut() {
            host.pump();
        }
        thread::sleep(tick);
    }
}
