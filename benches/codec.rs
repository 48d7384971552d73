use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stagelink::client::{DatagramSink, StreamConfig, StreamThrottle};
use stagelink::codec::{encode, encode_into, FrameDecoder};
use stagelink::host::{Dispatcher, ScheduledTask, TaskExecutor};
use stagelink::live_set::{command_table, LiveSet};
use stagelink::types::{params, Command, Reply};

fn batch_command() -> Command {
    Command::new(
        "batch_set_device_parameters",
        params! {
            "track_index" => 0,
            "device_index" => 0,
            "parameter_indices" => vec![1i64, 2, 3],
            "values" => vec![0.25, 0.5, 0.75],
        },
    )
    .with_id(42)
}

fn bench_encode(c: &mut Criterion) {
    let cmd = batch_command();
    let mut buf = Vec::with_capacity(256);

    c.bench_function("encode_command", |b| {
        b.iter(|| {
            encode_into(black_box(&cmd), &mut buf).unwrap();
        })
    });
}

fn bench_decode_stream(c: &mut Criterion) {
    let frame = encode(&batch_command()).unwrap();
    let burst: Vec<u8> = frame.iter().copied().cycle().take(frame.len() * 64).collect();

    c.bench_function("decode_64_frames", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            decoder.extend(black_box(&burst));
            let mut n = 0;
            while let Some(cmd) = decoder.next_message::<Command>().unwrap() {
                black_box(cmd);
                n += 1;
            }
            assert_eq!(n, 64);
        })
    });
}

fn bench_dispatch(c: &mut Criterion) {
    let mut dispatcher = Dispatcher::new(command_table(), LiveSet::demo());
    let cmd = batch_command();

    c.bench_function("dispatch_batch_set", |b| {
        b.iter(|| {
            let (task, mut rx) = ScheduledTask::with_reply(cmd.clone());
            dispatcher.execute(task);
            let reply: Reply = rx.try_recv().unwrap();
            black_box(reply);
        })
    });
}

struct Discard;

impl DatagramSink for Discard {
    fn send_datagram(&self, command: &Command) -> bool {
        black_box(command);
        true
    }
}

fn bench_throttle(c: &mut Criterion) {
    let mut throttle = StreamThrottle::new(StreamConfig::default(), params! { "track_index" => 0 });
    throttle.add_axis(0).unwrap();
    throttle.add_axis(1).unwrap();
    let t0 = Instant::now();
    let mut ms = 0u64;

    c.bench_function("throttle_sample", |b| {
        b.iter(|| {
            ms += 1;
            let x = (ms % 1000) as f64 / 1000.0;
            throttle.sample(&Discard, t0 + Duration::from_millis(ms), &[x, 1.0 - x]);
        })
    });
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode_stream,
    bench_dispatch,
    bench_throttle
);
criterion_main!(benches);
