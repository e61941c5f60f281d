//! Microbenchmarks for the hot ABI paths: the chunk ownership cycle and
//! the header codec.

use chunkring::{ChunkFlags, ChunkHeader, PageLayout, Smb, SmbConfig};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

fn bench_ownership_cycle(c: &mut Criterion) {
    let smb = Arc::new(Smb::in_process(SmbConfig::default()));
    assert!(smb.try_acquire_page(0, PageLayout::Four));
    let header = ChunkHeader {
        writer_id: 1,
        chunk_id: 1,
        packet_count: 1,
        flags: ChunkFlags::none(),
        target_buffer: 0,
    };

    c.bench_function("chunk_ownership_cycle", |b| {
        b.iter(|| {
            let mut chunk = smb.try_acquire_chunk(0, 0).expect("chunk free");
            chunk.write_header(&header);
            chunk.complete().expect("writer owned");
            let view = smb.try_begin_read(0, 0).expect("complete");
            black_box(view.header());
            view.release().expect("service owned");
        });
    });
}

fn bench_header_codec(c: &mut Criterion) {
    let header = ChunkHeader {
        writer_id: 42,
        chunk_id: 0xDEAD_BEEF,
        packet_count: 7,
        flags: ChunkFlags::none(),
        target_buffer: 3,
    };

    c.bench_function("chunk_header_encode_decode", |b| {
        b.iter(|| {
            let raw = black_box(&header).encode();
            black_box(ChunkHeader::decode(&raw))
        });
    });
}

criterion_group!(benches, bench_ownership_cycle, bench_header_codec);
criterion_main!(benches);
