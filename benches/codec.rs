//! 코덱 / 신뢰성 엔진 벤치마크

use std::time::Instant;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use rdl::sequence::ReceiveWindow;
use rdl::{decode, encode, Ack, Config, Connection, Message, MessageTag, MessageType, ReliabilityEngine};

fn message(size: usize) -> Message {
    Message {
        msg_type: MessageType::Application(MessageTag::saturating(1)),
        sequence: 1234,
        ack: Some(Ack {
            sequence: 1200,
            bitmap: 0xFFFF_0F0F,
        }),
        reliable: true,
        payload: Bytes::from(vec![0xAB; size]),
    }
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    for size in [0usize, 64, 1200, 8192] {
        let msg = message(size);
        let bytes = encode(&msg).unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &msg, |b, msg| {
            b.iter(|| encode(black_box(msg)).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &bytes, |b, bytes| {
            b.iter(|| decode(black_box(bytes)).unwrap())
        });
    }
    group.finish();
}

fn bench_window(c: &mut Criterion) {
    c.bench_function("window_mark_and_ack", |b| {
        b.iter(|| {
            let mut window = ReceiveWindow::new(1024);
            for seq in 0..256u16 {
                // 짝수 먼저, 홀수 나중
                let seq = if seq < 128 { seq * 2 } else { (seq - 128) * 2 + 1 };
                window.mark(seq);
                black_box(window.ack());
            }
        })
    });
}

fn bench_engine(c: &mut Criterion) {
    let engine = ReliabilityEngine::new(Config::default());
    let payload = Bytes::from(vec![0u8; 256]);

    c.bench_function("engine_send_receive_ack", |b| {
        b.iter(|| {
            let now = Instant::now();
            let peer = "127.0.0.1:9000".parse().unwrap();
            let mut sender = Connection::new(peer, 1, 1024, now);
            let mut receiver = Connection::new(peer, 1, 1024, now);
            sender.establish();
            receiver.establish();

            for _ in 0..64 {
                let out = engine
                    .send(&mut sender, MessageTag::saturating(1), payload.clone(), true, now)
                    .unwrap();
                let inbound = engine.receive(&mut receiver, decode(&out.datagram).unwrap(), now);
                if let Some(reply) = inbound.reply {
                    engine.receive(&mut sender, decode(&reply).unwrap(), now);
                }
            }
            black_box(sender.pending_count())
        })
    });
}

criterion_group!(benches, bench_codec, bench_window, bench_engine);
criterion_main!(benches);
