//! Writer-to-engine integration: records produced through the real writer
//! runtime, drained out of the SMB by the engine, and read back as
//! reassembled records.

use chunkring::{PageLayout, Smb, SmbConfig};
use chunkring_writer::{Arbiter, NullListener, StallPolicy};
use std::sync::Arc;
use trace_collector::{BufferEngine, FillPolicy, IngestError, RecordKind};

fn setup(pages: usize, layout: PageLayout) -> (Arbiter, BufferEngine) {
    let smb = Arc::new(Smb::in_process(SmbConfig::new(4096, pages).unwrap()));
    let arbiter = Arbiter::new(smb, layout, Arc::new(NullListener));
    let mut engine = BufferEngine::new();
    engine.create_buffer(1, 1 << 20, FillPolicy::RingBuffer);
    (arbiter, engine)
}

#[test]
fn ten_records_round_trip_in_order() {
    let (arbiter, mut engine) = setup(8, PageLayout::Four);
    let mut writer = arbiter.create_writer(1, StallPolicy::Drop).unwrap();

    for i in 0..10u64 {
        let mut rec = writer.begin_record();
        rec.append(&i.to_le_bytes()).unwrap();
        rec.append(&[0u8; 92]).unwrap(); // 100-byte records
        rec.finalize().unwrap();
    }
    writer.flush().unwrap();

    let summary = engine
        .drain_smb(7, arbiter.smb(), None, |_, _, _| {})
        .unwrap();
    // 10 x 104 framed bytes: the tenth record spills into a second chunk.
    assert_eq!(summary.chunks_ingested, 2);

    let (records, has_more) = engine.read_buffers(&[1], 100);
    assert!(!has_more);
    assert_eq!(records.len(), 10);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.kind, RecordKind::Data);
        assert_eq!(record.producer_id, 7);
        assert_eq!(record.writer_id, writer.writer_id());
        assert_eq!(record.payload.len(), 100);
        assert_eq!(record.payload[..8], (i as u64).to_le_bytes());
    }

    let stats = engine.buffer(1).unwrap().stats();
    assert_eq!(stats.records_lost, 0);
    assert_eq!(stats.chunks_lost, 0);
}

#[test]
fn fragmented_record_reassembles_through_the_engine() {
    let (arbiter, mut engine) = setup(8, PageLayout::Four);
    let mut writer = arbiter.create_writer(1, StallPolicy::Drop).unwrap();

    let body: Vec<u8> = (0..3000u32).map(|i| (i * 7) as u8).collect();
    let mut rec = writer.begin_record();
    rec.append(&body).unwrap();
    rec.finalize().unwrap();
    writer.flush().unwrap();

    let summary = engine
        .drain_smb(7, arbiter.smb(), None, |_, _, _| {})
        .unwrap();
    assert_eq!(summary.chunks_ingested, 3);

    let (records, _) = engine.read_buffers(&[1], 10);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload, body);
}

#[test]
fn interleaved_writers_keep_per_sequence_order() {
    let (arbiter, mut engine) = setup(8, PageLayout::Four);
    let mut w1 = arbiter.create_writer(1, StallPolicy::Drop).unwrap();
    let mut w2 = arbiter.create_writer(1, StallPolicy::Drop).unwrap();

    for i in 0..50u32 {
        for w in [&mut w1, &mut w2] {
            let mut rec = w.begin_record();
            rec.append(&i.to_le_bytes()).unwrap();
            rec.finalize().unwrap();
        }
    }
    w1.flush().unwrap();
    w2.flush().unwrap();

    engine.drain_smb(7, arbiter.smb(), None, |_, _, _| {}).unwrap();
    let (records, _) = engine.read_buffers(&[1], 1000);
    assert_eq!(records.len(), 100);

    for wid in [w1.writer_id(), w2.writer_id()] {
        let seq: Vec<u32> = records
            .iter()
            .filter(|r| r.writer_id == wid)
            .map(|r| u32::from_le_bytes(r.payload[..4].try_into().unwrap()))
            .collect();
        assert_eq!(seq, (0..50).collect::<Vec<u32>>());
    }
}

#[test]
fn crashed_writer_chunk_is_not_ingested() {
    let (arbiter, mut engine) = setup(2, PageLayout::Four);

    // A writer fills one chunk's worth and commits it, then "crashes"
    // mid-chunk: the second chunk stays WriterOwned.
    let mut writer = arbiter.create_writer(1, StallPolicy::Drop).unwrap();
    let mut rec = writer.begin_record();
    rec.append(&vec![1u8; 1500]).unwrap(); // spans into a second chunk
    std::mem::forget(rec);
    std::mem::forget(writer);

    let summary = engine
        .drain_smb(7, arbiter.smb(), None, |_, _, _| {})
        .unwrap();
    // Only the sealed first chunk is visible; no protocol violation.
    assert_eq!(summary.chunks_ingested, 1);

    let (records, _) = engine.read_buffers(&[1], 10);
    assert!(records.is_empty(), "the spanning record never completed");
}

#[test]
fn notification_bitmap_is_advisory_superset() {
    let (arbiter, mut engine) = setup(4, PageLayout::Four);
    let mut writer = arbiter.create_writer(1, StallPolicy::Drop).unwrap();

    let mut rec = writer.begin_record();
    rec.append(b"data").unwrap();
    rec.finalize().unwrap();
    writer.flush().unwrap();

    // Claim every page changed; only page 0 actually has a chunk.
    let mut pages = chunkring::PageBitmap::with_pages(4);
    for p in 0..4 {
        pages.set(p);
    }
    let summary = engine
        .drain_smb(7, arbiter.smb(), Some(&pages), |_, _, _| {})
        .unwrap();
    assert_eq!(summary.chunks_ingested, 1);

    // Re-scanning the same superset is a no-op.
    let summary = engine
        .drain_smb(7, arbiter.smb(), Some(&pages), |_, _, _| {})
        .unwrap();
    assert_eq!(summary.chunks_ingested, 0);
}

#[test]
fn freed_chunks_are_reusable_by_the_writer() {
    // Single chunk SMB: every commit must wait for the engine to drain.
    let (arbiter, mut engine) = setup(1, PageLayout::One);
    let mut writer = arbiter.create_writer(1, StallPolicy::Drop).unwrap();

    for round in 0..3u8 {
        let mut rec = writer.begin_record();
        rec.append(&[round; 16]).unwrap();
        rec.finalize().unwrap();
        writer.flush().unwrap();
        engine.drain_smb(7, arbiter.smb(), None, |_, _, _| {}).unwrap();
    }

    let (records, _) = engine.read_buffers(&[1], 10);
    assert_eq!(records.len(), 3);
    assert_eq!(records[2].payload, vec![2u8; 16]);
    assert_eq!(writer.stats().records_dropped, 0);
}

#[tokio::test]
async fn file_round_trip_reproduces_the_record_set() {
    {
        let (arbiter, mut engine) = setup(8, PageLayout::Four);
        let mut writer = arbiter.create_writer(1, StallPolicy::Drop).unwrap();

        for i in 0..20u8 {
            let mut rec = writer.begin_record();
            rec.append(&[i; 64]).unwrap();
            rec.finalize().unwrap();
        }
        writer.flush().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.trace");
        let mut sink = trace_collector::FileSink::create(&path).await.unwrap();

        let mut frames = Vec::new();
        engine
            .drain_smb(7, arbiter.smb(), None, |_, raw, payload| {
                frames.push((*raw, payload.to_vec()));
            })
            .unwrap();
        for (raw, payload) in &frames {
            sink.append_chunk(raw, payload).await.unwrap();
        }
        sink.flush().await.unwrap();
        drop(sink);

        let (live_records, _) = engine.read_buffers(&[1], 1000);

        // Offline re-ingestion through a fresh engine.
        let contents = trace_collector::read_trace_file(&path).await.unwrap();
        let mut offline = BufferEngine::new();
        offline.create_buffer(1, 1 << 20, FillPolicy::RingBuffer);
        for (raw, payload) in &contents.chunks {
            let header = chunkring::ChunkHeader::decode(raw);
            let producer = chunkring::ChunkHeader::decode_producer_id(raw);
            offline
                .ingest_chunk(producer, header, payload, |_, _, _| {})
                .unwrap();
        }
        let (offline_records, _) = offline.read_buffers(&[1], 1000);
        assert_eq!(offline_records, live_records);
    }
}

#[test]
fn duplicate_chunk_id_from_producer_is_fatal_to_the_drain() {
    let (arbiter, mut engine) = setup(2, PageLayout::Four);

    // Forge two chunks with the same id straight through the ABI.
    let smb = arbiter.smb();
    for idx in [0usize, 1] {
        assert!(smb.try_acquire_page(0, PageLayout::Four) || idx > 0);
        let mut chunk = smb.try_acquire_chunk(0, idx).unwrap();
        chunk.write_header(&chunkring::ChunkHeader {
            writer_id: 1,
            chunk_id: 5,
            packet_count: 0,
            flags: chunkring::ChunkFlags::none(),
            target_buffer: 1,
        });
        let payload_len = chunk.payload_len();
        chunk.payload_mut()[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(payload_len >= 4);
        chunk.complete().unwrap();
    }

    let err = engine
        .drain_smb(7, smb, None, |_, _, _| {})
        .unwrap_err();
    assert!(matches!(err, IngestError::NonMonotonicChunkId { .. }));
}
