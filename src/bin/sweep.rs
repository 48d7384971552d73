//! Sweep client.
//!
//! Connects to a running host, prints the session, then streams a two-axis
//! Lissajous sweep onto one device's parameters through the throttle, the
//! way a mouse or controller would.
//!
//! ```bash
//! cargo run --bin stagelink-sweep -- [track] [device] [x_param] [y_param] [seconds]
//! ```

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stagelink::client::{normalize, ClientSession, StreamThrottle};
use stagelink::types::params;

const SAMPLE_HZ: u64 = 500;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stagelink=info")),
        )
        .init();

    let args: Vec<i64> = std::env::args()
        .skip(1)
        .map(|a| a.parse().with_context(|| format!("not a number: {}", a)))
        .collect::<Result<_>>()?;
    let arg = |i: usize, default: i64| args.get(i).copied().unwrap_or(default);
    let (track, device) = (arg(0, 0), arg(1, 0));
    let (x_param, y_param) = (arg(2, 1), arg(3, 2));
    let seconds = arg(4, 5).max(1) as u64;

    let session = ClientSession::from_env();
    session.connect().await.context("failed to connect to host")?;
    let health = session.spawn_health_check();

    let info = session.call("get_session_info", params! {}).await?;
    info!(tempo = ?info.get("tempo"), tracks = ?info.get("track_count"), "session");

    let device_info = session
        .call(
            "get_device_parameters",
            params! { "track_index" => track, "device_index" => device },
        )
        .await?;
    info!(device = ?device_info.get("device_name"), "streaming to device");

    let mut throttle = StreamThrottle::new(
        session.config().stream,
        params! { "track_index" => track, "device_index" => device },
    );
    throttle.add_axis(x_param)?;
    throttle.add_axis(y_param)?;

    // Screen-like coordinates: 0..WIDTH to the right, 0..HEIGHT downwards.
    const WIDTH: f64 = 1920.0;
    const HEIGHT: f64 = 1080.0;
    let start = Instant::now();
    let total = Duration::from_secs(seconds);
    let mut ticker = tokio::time::interval(Duration::from_micros(1_000_000 / SAMPLE_HZ));

    loop {
        ticker.tick().await;
        let now = Instant::now();
        let elapsed = now.duration_since(start);
        if elapsed >= total {
            break;
        }
        let t = elapsed.as_secs_f64();
        let px = WIDTH * (0.5 + 0.5 * (t * 1.3).sin());
        let py = HEIGHT * (0.5 + 0.5 * (t * 0.7).cos());
        throttle.sample(
            &session,
            now,
            &[normalize(px, WIDTH, false), normalize(py, HEIGHT, true)],
        );
    }
    throttle.flush(&session, Instant::now());

    let stats = throttle.stats();
    info!(
        samples = stats.samples,
        datagrams = stats.datagrams,
        failed = stats.failed_sends,
        "sweep done"
    );

    let params = session
        .call(
            "get_device_parameters",
            params! { "track_index" => track, "device_index" => device },
        )
        .await?;
    info!(parameters = ?params.get("parameters"), "final state");

    session.close().await;
    health.abort();
    Ok(())
}
