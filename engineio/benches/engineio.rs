use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use engineio_client::packet::{decode_payload, encode_payload, Encoded};
use engineio_client::{Packet, PacketId};

fn message() -> Packet {
    Packet::new(PacketId::Message, Bytes::from("hello world"))
}

fn binary() -> Packet {
    Packet::new(PacketId::MessageBinary, Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]))
}

fn batch() -> Vec<Packet> {
    (0..16)
        .map(|i| if i % 4 == 0 { binary() } else { message() })
        .collect()
}

fn criterion_packet_encode(c: &mut Criterion) {
    let text = message();
    let data = binary();
    c.bench_function("engine io encode text", |b| {
        b.iter(|| black_box(&text).encode(true).unwrap())
    });
    c.bench_function("engine io encode binary as base64", |b| {
        b.iter(|| black_box(&data).encode(false).unwrap())
    });
}

fn criterion_packet_decode(c: &mut Criterion) {
    c.bench_function("engine io decode text", |b| {
        b.iter(|| Packet::decode_str(black_box("4hello world")).unwrap())
    });
    let encoded = Encoded::Binary(Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]));
    c.bench_function("engine io decode binary", |b| {
        b.iter(|| Packet::decode(black_box(encoded.clone())).unwrap())
    });
}

fn criterion_payload(c: &mut Criterion) {
    let packets = batch();
    let payload = encode_payload(&packets).unwrap();
    c.bench_function("engine io encode payload", |b| {
        b.iter(|| encode_payload(black_box(&packets)).unwrap())
    });
    c.bench_function("engine io decode payload", |b| {
        b.iter(|| decode_payload(black_box(&payload)))
    });
}

criterion_group!(
    benches,
    criterion_packet_encode,
    criterion_packet_decode,
    criterion_payload
);
criterion_main!(benches);
