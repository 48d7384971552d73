use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_test::assert_ok;

use stagelink::client::{Backoff, ClientConfig, ClientSession, ConnectionState};
use stagelink::codec::{decode_datagram, encode};
use stagelink::types::{params, Command, Params, Reply};

/// What a scripted peer does with one non-probe command.
#[derive(Clone, Copy)]
enum Behavior {
    /// Never answer.
    Ignore,
    /// Send a reply with a bogus id first, then the real one.
    StaleFirst,
    /// Close the connection and stop listening.
    Die,
}

struct FakeHost {
    addr: SocketAddr,
    commands: Arc<AtomicUsize>,
}

/// Answers `ping` like a real host and applies `behavior` to everything else.
async fn fake_host(behavior: Behavior) -> FakeHost {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let commands = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&commands);

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let seen = Arc::clone(&seen);
            let died = serve(socket, behavior, seen).await;
            if died {
                // Dropping the listener makes later connects fail.
                return;
            }
        }
    });

    FakeHost { addr, commands }
}

async fn serve(socket: TcpStream, behavior: Behavior, seen: Arc<AtomicUsize>) -> bool {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let cmd: Command = serde_json::from_str(&line).unwrap();
        if cmd.name == "ping" {
            let pong = Reply::success(cmd.id, params! { "pong" => true });
            write_half.write_all(&encode(&pong).unwrap()).await.unwrap();
            continue;
        }

        seen.fetch_add(1, Ordering::SeqCst);
        match behavior {
            Behavior::Ignore => {}
            Behavior::StaleFirst => {
                let stale = Reply::success(Some(9_999), params! { "stale" => true });
                let real = Reply::success(cmd.id, cmd.params.clone());
                let mut out = encode(&stale).unwrap();
                out.extend(encode(&real).unwrap());
                write_half.write_all(&out).await.unwrap();
            }
            Behavior::Die => return true,
        }
    }
    false
}

fn config_for(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        host: addr.ip().to_string(),
        tcp_port: addr.port(),
        connect_timeout: Duration::from_millis(500),
        call_timeout: Duration::from_millis(200),
        probe_timeout: Duration::from_millis(500),
        max_retries: 2,
        backoff: Backoff::fixed(Duration::from_millis(50)),
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn timeouts_are_retried_then_surfaced() {
    let fake = fake_host(Behavior::Ignore).await;
    let session = ClientSession::new(config_for(fake.addr));
    session.connect().await.unwrap();

    let started = Instant::now();
    let err = session
        .call_and_wait(
            Command::new("slow", Params::new()),
            Duration::from_millis(200),
            2,
        )
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "{:?}", err);
    assert_eq!(fake.commands.load(Ordering::SeqCst), 3);
    // 3 attempts x 200ms + 2 backoffs x 50ms, plus reconnect probes.
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn host_killed_mid_call_gives_transport_error() {
    let fake = fake_host(Behavior::Die).await;
    let session = ClientSession::new(config_for(fake.addr));
    session.connect().await.unwrap();

    let max_retries = 2;
    let call_timeout = Duration::from_millis(200);
    let backoff = Duration::from_millis(50);

    let started = Instant::now();
    let err = session
        .call_and_wait(Command::new("get_session_info", Params::new()), call_timeout, max_retries)
        .await
        .unwrap_err();

    assert!(err.is_transport(), "{:?}", err);
    assert!(started.elapsed() <= (call_timeout + backoff) * max_retries + Duration::from_millis(200));
    assert_eq!(session.status().await.state, ConnectionState::Error);
    assert!(!session.is_connected().await);
}

#[tokio::test]
async fn stale_replies_are_discarded() {
    let fake = fake_host(Behavior::StaleFirst).await;
    let session = ClientSession::new(config_for(fake.addr));
    session.connect().await.unwrap();

    let result = session
        .call("echo", params! { "value" => 7 })
        .await
        .unwrap();
    assert_eq!(result, params! { "value" => 7 });

    // The next call must not see the leftover stale reply either.
    let result = session
        .call("echo", params! { "value" => 8 })
        .await
        .unwrap();
    assert_eq!(result, params! { "value" => 8 });
}

#[tokio::test]
async fn connect_to_nothing_fails_fast() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let session = ClientSession::new(config_for(addr));
    let err = session.connect().await.unwrap_err();
    assert!(err.is_transport(), "{:?}", err);

    let status = session.status().await;
    assert_eq!(status.state, ConnectionState::Error);
    assert!(!status.stream_ready);
}

#[tokio::test]
async fn calls_connect_lazily() {
    let fake = fake_host(Behavior::StaleFirst).await;
    let session = ClientSession::new(config_for(fake.addr));
    assert_eq!(session.status().await.state, ConnectionState::Disconnected);

    session.call("echo", Params::new()).await.unwrap();
    let status = session.status().await;
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.calls, 1);
    assert!(status.since_success.is_some());
}

#[tokio::test]
async fn close_drops_the_connection() {
    let fake = fake_host(Behavior::StaleFirst).await;
    let session = ClientSession::new(config_for(fake.addr));
    session.connect().await.unwrap();
    assert!(session.status().await.stream_ready);

    session.close().await;
    assert!(!session.is_connected().await);
    let status = session.status().await;
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(!status.stream_ready);
    assert!(!session.send_stream(&Command::ping()));
}

/// A peer whose first connection answers the connect probe and then goes
/// silent. Later connections answer every ping. While `up` is false, open
/// connections are dropped and new ones are closed right after accept.
struct FlakyHost {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    up: Arc<AtomicBool>,
}

async fn flaky_host() -> FlakyHost {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let up = Arc::new(AtomicBool::new(true));

    let count = Arc::clone(&connections);
    let alive = Arc::clone(&up);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            if !alive.load(Ordering::SeqCst) {
                continue;
            }
            let nth = count.fetch_add(1, Ordering::SeqCst) + 1;
            let pings = if nth == 1 { 1 } else { usize::MAX };
            tokio::spawn(answer_pings(socket, pings, Arc::clone(&alive)));
        }
    });

    FlakyHost {
        addr,
        connections,
        up,
    }
}

async fn answer_pings(socket: TcpStream, mut budget: usize, up: Arc<AtomicBool>) {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();
    while up.load(Ordering::SeqCst) {
        let line = match tokio::time::timeout(Duration::from_millis(20), lines.next_line()).await {
            Err(_) => continue,
            Ok(Ok(Some(line))) => line,
            Ok(_) => return,
        };
        if budget == 0 {
            continue;
        }
        budget -= 1;
        let cmd: Command = serde_json::from_str(&line).unwrap();
        let pong = Reply::success(cmd.id, params! { "pong" => true });
        if write_half.write_all(&encode(&pong).unwrap()).await.is_err() {
            return;
        }
    }
}

fn health_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        probe_timeout: Duration::from_millis(50),
        ..config_for(addr)
    }
}

#[tokio::test]
async fn failed_probes_force_reconnect_at_threshold() {
    let flaky = flaky_host().await;
    let session = ClientSession::new(ClientConfig {
        failure_threshold: 2,
        stale_after: Duration::from_secs(60),
        ..health_config(flaky.addr)
    });
    session.connect().await.unwrap();
    assert_eq!(flaky.connections.load(Ordering::SeqCst), 1);

    // One missed probe: below the threshold, the connection is kept.
    assert!(!session.health_check().await);
    assert_eq!(flaky.connections.load(Ordering::SeqCst), 1);
    assert_eq!(session.status().await.consecutive_failures, 1);
    assert!(session.is_connected().await);

    // Second miss reaches the threshold and reconnects.
    assert!(session.health_check().await);
    assert_eq!(flaky.connections.load(Ordering::SeqCst), 2);
    let status = session.status().await;
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.consecutive_failures, 0);

    // The fresh connection answers probes.
    assert!(session.health_check().await);
    assert_eq!(flaky.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn stale_session_is_reconnected() {
    let flaky = flaky_host().await;
    let stale_after = Duration::from_millis(300);
    let session = ClientSession::new(ClientConfig {
        failure_threshold: 10,
        stale_after,
        ..health_config(flaky.addr)
    });
    session.connect().await.unwrap();

    assert!(!session.health_check().await);
    assert_eq!(flaky.connections.load(Ordering::SeqCst), 1);

    tokio::time::sleep(stale_after).await;
    assert!(session.health_check().await);
    assert_eq!(flaky.connections.load(Ordering::SeqCst), 2);
    assert!(session.status().await.since_success.unwrap() < stale_after);
}

#[tokio::test]
async fn background_health_check_recovers_after_host_restart() {
    let flaky = flaky_host().await;
    let session = ClientSession::new(ClientConfig {
        health_interval: Duration::from_millis(50),
        failure_threshold: 1,
        ..health_config(flaky.addr)
    });
    session.connect().await.unwrap();
    let checker = session.spawn_health_check();

    // The first connection goes silent, so the checker replaces it.
    let deadline = Instant::now() + Duration::from_secs(2);
    while flaky.connections.load(Ordering::SeqCst) < 2 {
        assert!(Instant::now() < deadline, "no reconnect after silent probe");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    flaky.up.store(false, Ordering::SeqCst);
    let deadline = Instant::now() + Duration::from_secs(2);
    while session.status().await.state == ConnectionState::Connected {
        assert!(Instant::now() < deadline, "host going away was not noticed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let before = flaky.connections.load(Ordering::SeqCst);

    flaky.up.store(true, Ordering::SeqCst);
    let deadline = Instant::now() + Duration::from_secs(2);
    while session.status().await.state != ConnectionState::Connected {
        assert!(Instant::now() < deadline, "no reconnect after host came back");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(flaky.connections.load(Ordering::SeqCst) > before);
    assert_ok!(session.call("ping", Params::new()).await);

    session.close().await;
    tokio::time::timeout(Duration::from_secs(1), checker)
        .await
        .expect("health check did not stop after close")
        .unwrap();
}

#[tokio::test]
async fn first_datagram_after_init_is_sent() {
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let session = ClientSession::new(ClientConfig {
        host: "127.0.0.1".to_string(),
        udp_port: receiver.local_addr().unwrap().port(),
        ..ClientConfig::default()
    });
    session.init_stream().await.unwrap();

    let cmd = Command::new("set_tempo", params! { "tempo" => 128.0 });
    assert!(session.send_stream(&cmd));
    assert_eq!(session.status().await.datagrams_sent, 1);

    let mut buf = [0u8; 1024];
    let (n, _) = tokio::time::timeout(Duration::from_secs(1), receiver.recv_from(&mut buf))
        .await
        .expect("datagram never arrived")
        .unwrap();
    let got: Command = decode_datagram(&buf[..n]).unwrap();
    assert_eq!(got.name, "set_tempo");
    assert_eq!(got.params["tempo"].as_f64(), Some(128.0));
}
