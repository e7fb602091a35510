//! Criterion benchmarks for the send pump and serialization
//!
//! Run with: cargo bench

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use repnet::core::{Buffer, BufferPool, KindInfo, KindTable, Nid, TypeTag};
use repnet::network::{AsyncSender, FrameSink};
use repnet::protocol::{
    varint, BinaryReader, BinaryWriter, FrameDecoder, MessageHeader, MessageId, Point, Reader,
    Writer,
};

const ARMY: TypeTag = TypeTag(1);
static ROWS: [KindInfo; 1] = [KindInfo::new(ARMY, "Army", true)];
static KINDS: KindTable = KindTable::new(&ROWS);

/// Completes writes immediately and discards the bytes.
struct Discard;

impl FrameSink for Discard {
    fn transmit(&self, sender: &AsyncSender, buffer: Buffer) {
        let len = buffer.len();
        black_box(buffer.as_bytes());
        sender.on_sent(buffer, len, self);
    }

    fn is_connected(&self) -> bool {
        true
    }
}

fn bench_varint(c: &mut Criterion) {
    let mut group = c.benchmark_group("varint");
    group.throughput(Throughput::Elements(1));

    group.bench_function("encode", |b| {
        let mut i = 0u32;
        b.iter(|| {
            black_box(varint::encode_u32(black_box(i)));
            i = i.wrapping_add(7919);
        });
    });

    group.bench_function("decode", |b| {
        let (bytes, len) = varint::encode_u32(300_000);
        b.iter(|| black_box(varint::read_u32(black_box(&bytes[..len]))));
    });

    group.finish();
}

fn bench_sender(c: &mut Criterion) {
    let mut group = c.benchmark_group("sender");

    for payload_len in [16usize, 256, 4096] {
        group.throughput(Throughput::Bytes(payload_len as u64));
        group.bench_function(format!("send_{payload_len}"), |b| {
            let sender = AsyncSender::new(Arc::new(BufferPool::new(1024, 16)));
            let payload = vec![0xA5u8; payload_len];
            b.iter(|| sender.send(black_box(&payload), &Discard));
        });
    }

    group.bench_function("decode_1000_frames", |b| {
        let stream: Vec<u8> = (0..1000)
            .flat_map(|i| repnet::protocol::encode_frame(&vec![i as u8; 64]))
            .collect();
        b.iter(|| {
            let mut decoder = FrameDecoder::new(1 << 20);
            decoder.push(black_box(&stream));
            let mut n = 0;
            while let Ok(Some(frame)) = decoder.next_frame() {
                n += frame.len();
            }
            black_box(n)
        });
    });

    group.finish();
}

fn bench_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialize");
    group.throughput(Throughput::Elements(1));
    let nid = Nid::new(ARMY, 12, 4000).unwrap();

    let write = || {
        let mut w = BinaryWriter::with_capacity(64).with_kinds(KINDS);
        w.write_message_header(&MessageHeader::new(MessageId::ObjectUpdate, nid))
            .unwrap();
        w.write_point("pos", Point::new(12.5, -4.0)).unwrap();
        w.write_var_i32("hp", -250).unwrap();
        w.write_unique_str("banner", "Crimson").unwrap();
        w.into_bytes()
    };

    group.bench_function("write_update", |b| b.iter(|| black_box(write())));

    let bytes = write();
    group.bench_function("read_update", |b| {
        b.iter(|| {
            let mut r = BinaryReader::new(black_box(&bytes)).with_kinds(KINDS);
            let header = r.read_message_header().unwrap();
            let pos = r.read_point("pos").unwrap();
            let hp = r.read_var_i32("hp").unwrap();
            let banner = r.read_unique_str("banner").unwrap();
            black_box((header, pos, hp, banner))
        });
    });

    group.finish();
}

criterion_group!(benches, bench_varint, bench_sender, bench_serialize);
criterion_main!(benches);
