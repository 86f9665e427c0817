//! Benchmarks for telemetry framing
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use daqlink::backend::framer::{extract, DataPacket, PacketBuffer};

/// Encoded stream of `count` packets with `nodes` samples each
fn stream(count: u32, nodes: u32, noise_every: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    for id in 0..count {
        if noise_every > 0 && id % noise_every == 0 {
            bytes.extend_from_slice(&[0x13, 0x37, 0xEF, 0xBE]);
        }
        let payload = (0..nodes).map(|n| id.wrapping_mul(n + 1)).collect();
        bytes.extend(DataPacket::new(id, payload).encode());
    }
    bytes
}

fn bench_extract_single(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract_single");

    for nodes in [1u32, 8, 64] {
        let bytes = stream(1, nodes, 0);
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(nodes), &bytes, |b, bytes| {
            b.iter(|| black_box(extract(black_box(bytes))))
        });
    }

    group.finish();
}

fn bench_drain_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain_stream");

    for (label, noise_every) in [("clean", 0u32), ("noisy", 4)] {
        let bytes = stream(1000, 8, noise_every);
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::new(label, 1000), &bytes, |b, bytes| {
            b.iter(|| {
                let mut buffer = PacketBuffer::new();
                buffer.extend(bytes);
                let mut samples = 0usize;
                for packet in buffer.drain_packets() {
                    samples += packet.payload.len();
                }
                black_box(samples)
            })
        });
    }

    group.finish();
}

fn bench_chunked_arrival(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunked_arrival");
    let bytes = stream(1000, 8, 0);

    for chunk in [16usize, 256, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut buffer = PacketBuffer::new();
                let mut packets = 0usize;
                for part in bytes.chunks(chunk) {
                    buffer.extend(part);
                    packets += buffer.drain_packets().count();
                }
                black_box(packets)
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_extract_single,
    bench_drain_stream,
    bench_chunked_arrival
);
criterion_main!(benches);
