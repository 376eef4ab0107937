//! Benchmarks for the wire codec hot paths.
//!
//! Run with: cargo bench -p coapd-msg --bench codec

use bytes::Bytes;
use coapd_msg::{codec, ContentFormat, Code, Message, MessageType, Token};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn request_message() -> Message {
    let mut msg = Message::new(MessageType::Confirmable, Code::GET, 0x3039);
    msg.token = Token::new(&[0x01, 0x02, 0x03]).unwrap();
    msg.set_path("/a/b/c/d/e");
    msg.set_content_format(ContentFormat::TEXT_PLAIN);
    msg.payload = Bytes::from_static(&[0x01]);
    msg
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));

    let msg = request_message();
    let mut buf = vec![0u8; 1024];
    group.bench_function("request", |b| {
        b.iter(|| codec::encode(black_box(&msg), &mut buf).unwrap())
    });

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(1));

    let wire = codec::encode_to_bytes(&request_message()).unwrap();
    group.bench_function("request", |b| {
        b.iter(|| codec::decode(black_box(wire.clone())).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
