use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use socketio_client::{Chunk, Decoder, Encoder, Packet, PacketId, Value};

fn event() -> Packet {
    let data = json!(["message", {"user": "alice", "text": "hello world", "tags": [1, 2, 3]}]);
    Packet::new(PacketId::Event, "/chat", Some(Value::from(data)), Some(12))
}

fn binary_event() -> Packet {
    let data = Value::Array(vec![
        Value::from("upload"),
        Value::from("file.bin"),
        Value::from(Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8])),
        Value::from(Bytes::from_static(&[9, 10, 11, 12])),
    ]);
    Packet::new(PacketId::Event, "/", Some(data), None)
}

fn criterion_encode(c: &mut Criterion) {
    let encoder = Encoder;
    let text = event();
    let binary = binary_event();
    c.bench_function("socket io encode event", |b| {
        b.iter(|| encoder.encode(black_box(&text)))
    });
    c.bench_function("socket io encode binary event", |b| {
        b.iter(|| encoder.encode(black_box(&binary)))
    });
}

fn criterion_decode(c: &mut Criterion) {
    let encoder = Encoder;
    let text = encoder.encode(&event());
    let binary = encoder.encode(&binary_event());

    c.bench_function("socket io decode event", |b| {
        b.iter(|| decode(black_box(&text)))
    });
    c.bench_function("socket io decode binary event", |b| {
        b.iter(|| decode(black_box(&binary)))
    });
}

fn decode(chunks: &[Chunk]) -> Option<Packet> {
    let mut decoder = Decoder::new();
    let mut packet = None;
    for chunk in chunks {
        packet = decoder.add(chunk.clone()).unwrap();
    }
    packet
}

criterion_group!(benches, criterion_encode, criterion_decode);
criterion_main!(benches);
