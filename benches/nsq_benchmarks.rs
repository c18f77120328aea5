use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nsq_client::wire::codec::{encode_mpub, encode_pub, Reader};

fn frame_bytes(frame_type: i32, body: &[u8]) -> Vec<u8> {
    let size = (body.len() + 4) as i32;
    let mut out = Vec::new();
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(&frame_type.to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn decode_response(c: &mut Criterion) {
    let bytes = frame_bytes(0, b"OK");
    c.bench_function("decode_response_frame", |b| {
        b.iter(|| {
            let mut reader = Reader::new();
            reader.feed(black_box(&bytes));
            black_box(reader.get().unwrap())
        })
    });
}

fn decode_message(c: &mut Criterion) {
    let mut body = Vec::new();
    body.extend_from_slice(&1i64.to_be_bytes());
    body.extend_from_slice(&1u16.to_be_bytes());
    body.extend_from_slice(b"0123456789abcdef");
    body.extend_from_slice(b"benchmark payload");
    let bytes = frame_bytes(2, &body);

    c.bench_function("decode_message_frame", |b| {
        b.iter(|| {
            let mut reader = Reader::new();
            reader.feed(black_box(&bytes));
            black_box(reader.get().unwrap())
        })
    });
}

fn encode_pub_command(c: &mut Criterion) {
    c.bench_function("encode_pub", |b| {
        b.iter(|| black_box(encode_pub("bench-topic", b"benchmark payload")))
    });
}

fn encode_mpub_command(c: &mut Criterion) {
    let bodies: Vec<&[u8]> = vec![b"one", b"two", b"three", b"four"];
    c.bench_function("encode_mpub", |b| {
        b.iter(|| black_box(encode_mpub("bench-topic", &bodies)))
    });
}

criterion_group!(
    benches,
    decode_response,
    decode_message,
    encode_pub_command,
    encode_mpub_command
);
criterion_main!(benches);
