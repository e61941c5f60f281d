//! Chunk ingestion: from SMB pages into central buffers.
//!
//! The engine owns every central buffer in the service (buffer ids are
//! service-global, so a chunk's `target_buffer` field alone routes it) and
//! the ingest-side monotonicity index per `(producer, writer)`. All of it
//! lives on the single service task; nothing here is shared or locked.

use crate::buffer::{FillPolicy, InsertOutcome, TraceBuffer};
use crate::records::{BufferStatsSnapshot, Record};
use chunkring::{
    parse_fragments, BufferId, ChunkHeader, FragmentError, PageBitmap, ProducerId, Smb, WriterId,
    CHUNK_HEADER_LEN,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Ingestion failures. All of these mean the producer broke the protocol
/// and its connection must be torn down; losses from ordinary backpressure
/// are counters, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    /// Chunk header carries writer id 0.
    #[error("chunk header carries the invalid writer id 0")]
    ZeroWriterId,

    /// Reserved flag bits are set.
    #[error("chunk header carries reserved flag bits {bits:#04x}")]
    ReservedFlags { bits: u8 },

    /// The fragment stream does not parse.
    #[error(transparent)]
    Fragment(#[from] FragmentError),

    /// Chunk ids of a writer sequence must be strictly increasing.
    #[error(
        "non-monotonic chunk id for producer {producer} writer {writer}: {got} after {last}"
    )]
    NonMonotonicChunkId {
        producer: ProducerId,
        writer: WriterId,
        last: u32,
        got: u32,
    },

    /// The ABI reported an illegal state transition while draining.
    #[error(transparent)]
    Abi(#[from] chunkring::AbiError),
}

/// Counters for one drain pass over an SMB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Chunks copied into a central buffer.
    pub chunks_ingested: u64,
    /// Chunks released without a home (their buffer was freed).
    pub chunks_orphaned: u64,
}

/// The service-side buffer engine.
#[derive(Default)]
pub struct BufferEngine {
    buffers: HashMap<BufferId, TraceBuffer>,
    /// Highest chunk id ingested per writer sequence; strict monotonicity
    /// is the ABI contract (no chunk retries).
    last_chunk_ids: HashMap<(ProducerId, WriterId), u32>,
}

impl BufferEngine {
    pub fn new() -> BufferEngine {
        BufferEngine::default()
    }

    /// Registers a central buffer under a service-global id.
    pub fn create_buffer(&mut self, id: BufferId, capacity_bytes: usize, policy: FillPolicy) {
        debug_assert!(!self.buffers.contains_key(&id), "buffer id reused while live");
        self.buffers.insert(id, TraceBuffer::new(id, capacity_bytes, policy));
    }

    /// Destroys a buffer, discarding its slots and read state.
    pub fn free_buffer(&mut self, id: BufferId) {
        self.buffers.remove(&id);
    }

    pub fn buffer(&self, id: BufferId) -> Option<&TraceBuffer> {
        self.buffers.get(&id)
    }

    /// Validates and copies one committed chunk. `on_chunk` fires with the
    /// sanitized raw header (producer id stamped into the reserved tail)
    /// for chunks that were actually stored - the file sink hook.
    pub fn ingest_chunk(
        &mut self,
        producer: ProducerId,
        header: ChunkHeader,
        payload: &[u8],
        mut on_chunk: impl FnMut(BufferId, &[u8; CHUNK_HEADER_LEN], &[u8]),
    ) -> Result<InsertOutcome, IngestError> {
        if header.writer_id == 0 {
            return Err(IngestError::ZeroWriterId);
        }
        if header.flags.has_reserved_bits() {
            return Err(IngestError::ReservedFlags {
                bits: header.flags.bits(),
            });
        }
        parse_fragments(payload)?;

        let key = (producer, header.writer_id);
        if let Some(&last) = self.last_chunk_ids.get(&key) {
            if header.chunk_id <= last {
                return Err(IngestError::NonMonotonicChunkId {
                    producer,
                    writer: header.writer_id,
                    last,
                    got: header.chunk_id,
                });
            }
        }
        self.last_chunk_ids.insert(key, header.chunk_id);

        let Some(buffer) = self.buffers.get_mut(&header.target_buffer) else {
            // The buffer raced away (session freed while the chunk was in
            // flight). Not a protocol violation; the chunk is dropped.
            tracing::debug!(
                producer,
                target = header.target_buffer,
                "chunk for freed buffer dropped"
            );
            return Ok(InsertOutcome::Discarded);
        };

        let outcome = buffer.insert(producer, header, payload);
        if outcome == InsertOutcome::Stored {
            let mut raw = header.encode();
            ChunkHeader::encode_producer_id(&mut raw, producer);
            on_chunk(header.target_buffer, &raw, payload);
        }
        Ok(outcome)
    }

    /// Drains every Complete chunk out of `smb`.
    ///
    /// `pages` narrows the scan to a notification's bitmap; it is treated
    /// as advisory (a superset re-scans to a no-op, and `None` scans the
    /// whole region, which the periodic tick uses).
    ///
    /// On a protocol violation the offending chunk is released and the
    /// error returned; the caller disconnects the producer.
    pub fn drain_smb(
        &mut self,
        producer: ProducerId,
        smb: &Arc<Smb>,
        pages: Option<&PageBitmap>,
        mut on_chunk: impl FnMut(BufferId, &[u8; CHUNK_HEADER_LEN], &[u8]),
    ) -> Result<DrainSummary, IngestError> {
        let mut summary = DrainSummary::default();
        let all_pages = 0..smb.num_pages();
        let scan: Vec<usize> = match pages {
            Some(bitmap) => bitmap.iter().filter(|&p| p < smb.num_pages()).collect(),
            None => all_pages.collect(),
        };

        for page in scan {
            let snapshot = smb.snapshot_page(page);
            let complete: Vec<usize> = snapshot.complete_chunks().collect();
            for chunk_index in complete {
                let Some(view) = smb.try_begin_read(page, chunk_index) else {
                    continue;
                };
                let header = view.header();
                let result = self.ingest_chunk(producer, header, view.payload(), &mut on_chunk);
                // The slot goes back to the writer even when the chunk is
                // rejected; an unusable SMB is torn down by the caller.
                view.release()?;
                match result {
                    Ok(InsertOutcome::Stored) => summary.chunks_ingested += 1,
                    Ok(InsertOutcome::Discarded) => summary.chunks_orphaned += 1,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(summary)
    }

    /// Reads up to `max` reassembled records across `buffer_ids`, in
    /// per-sequence order. Returns the records and whether more remain.
    pub fn read_buffers(&mut self, buffer_ids: &[BufferId], max: usize) -> (Vec<Record>, bool) {
        let mut out = Vec::new();
        let mut has_more = false;
        for id in buffer_ids {
            let Some(buffer) = self.buffers.get_mut(id) else {
                continue;
            };
            let remaining = max.saturating_sub(out.len());
            if buffer.read_records(remaining, &mut out) {
                has_more = true;
            }
        }
        (out, has_more)
    }

    /// Stats snapshots for a session's buffers, in id order given.
    pub fn stats_snapshots(&self, buffer_ids: &[BufferId]) -> Vec<BufferStatsSnapshot> {
        buffer_ids
            .iter()
            .filter_map(|id| self.buffers.get(id).map(TraceBuffer::stats_snapshot))
            .collect()
    }

    /// Total losses across a session's buffers, for the Degraded status.
    pub fn loss_totals(&self, buffer_ids: &[BufferId]) -> (u64, u64) {
        let mut bytes = 0;
        let mut records = 0;
        for id in buffer_ids {
            if let Some(b) = self.buffers.get(id) {
                let s = b.stats();
                bytes += s.bytes_lost;
                records += s.records_lost;
            }
        }
        (bytes, records)
    }

    /// Drops all per-producer index state after a disconnect.
    pub fn forget_producer(&mut self, producer: ProducerId) {
        self.last_chunk_ids.retain(|(p, _), _| *p != producer);
        for buffer in self.buffers.values_mut() {
            buffer.forget_producer(producer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkring::ChunkFlags;

    fn header(writer: WriterId, chunk_id: u32, target: BufferId) -> ChunkHeader {
        ChunkHeader {
            writer_id: writer,
            chunk_id,
            packet_count: 1,
            flags: ChunkFlags::none(),
            target_buffer: target,
        }
    }

    fn record_payload(bytes: &[u8]) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        p.extend_from_slice(bytes);
        p.extend_from_slice(&u32::MAX.to_le_bytes());
        p
    }

    #[test]
    fn ingest_routes_by_target_buffer() {
        let mut engine = BufferEngine::new();
        engine.create_buffer(1, 1 << 16, FillPolicy::RingBuffer);
        engine.create_buffer(2, 1 << 16, FillPolicy::RingBuffer);

        engine
            .ingest_chunk(9, header(1, 1, 1), &record_payload(b"one"), |_, _, _| {})
            .unwrap();
        engine
            .ingest_chunk(9, header(2, 1, 2), &record_payload(b"two"), |_, _, _| {})
            .unwrap();

        let (a, _) = engine.read_buffers(&[1], 100);
        let (b, _) = engine.read_buffers(&[2], 100);
        assert_eq!(a[0].payload, b"one");
        assert_eq!(b[0].payload, b"two");
    }

    #[test]
    fn zero_writer_id_is_a_violation() {
        let mut engine = BufferEngine::new();
        engine.create_buffer(1, 1 << 16, FillPolicy::RingBuffer);
        let err = engine
            .ingest_chunk(9, header(0, 1, 1), &record_payload(b"x"), |_, _, _| {})
            .unwrap_err();
        assert_eq!(err, IngestError::ZeroWriterId);
    }

    #[test]
    fn reserved_flag_bits_are_a_violation() {
        let mut engine = BufferEngine::new();
        engine.create_buffer(1, 1 << 16, FillPolicy::RingBuffer);
        let mut h = header(1, 1, 1);
        h.flags = ChunkFlags::from_bits(0b100);
        let err = engine
            .ingest_chunk(9, h, &record_payload(b"x"), |_, _, _| {})
            .unwrap_err();
        assert!(matches!(err, IngestError::ReservedFlags { bits: 0b100 }));
    }

    #[test]
    fn chunk_ids_must_strictly_increase() {
        let mut engine = BufferEngine::new();
        engine.create_buffer(1, 1 << 16, FillPolicy::RingBuffer);
        engine
            .ingest_chunk(9, header(1, 5, 1), &record_payload(b"x"), |_, _, _| {})
            .unwrap();
        // A repeat (the "retry" the ABI forbids) is a violation.
        let err = engine
            .ingest_chunk(9, header(1, 5, 1), &record_payload(b"y"), |_, _, _| {})
            .unwrap_err();
        assert!(matches!(err, IngestError::NonMonotonicChunkId { last: 5, got: 5, .. }));

        // Gaps are fine at ingest (drops are legal); order is not.
        engine
            .ingest_chunk(9, header(1, 9, 1), &record_payload(b"z"), |_, _, _| {})
            .unwrap();

        // Same writer id on another producer is an independent sequence.
        engine
            .ingest_chunk(10, header(1, 1, 1), &record_payload(b"w"), |_, _, _| {})
            .unwrap();
    }

    #[test]
    fn chunk_for_freed_buffer_is_dropped_not_fatal() {
        let mut engine = BufferEngine::new();
        let outcome = engine
            .ingest_chunk(9, header(1, 1, 44), &record_payload(b"x"), |_, _, _| {})
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Discarded);
    }

    #[test]
    fn forget_producer_resets_monotonicity() {
        let mut engine = BufferEngine::new();
        engine.create_buffer(1, 1 << 16, FillPolicy::RingBuffer);
        engine
            .ingest_chunk(9, header(1, 5, 1), &record_payload(b"x"), |_, _, _| {})
            .unwrap();
        engine.forget_producer(9);
        // A reconnected producer starts its sequences over.
        engine
            .ingest_chunk(9, header(1, 1, 1), &record_payload(b"y"), |_, _, _| {})
            .unwrap();
    }

    #[test]
    fn file_hook_sees_sanitized_header() {
        let mut engine = BufferEngine::new();
        engine.create_buffer(1, 1 << 16, FillPolicy::RingBuffer);
        let mut seen = Vec::new();
        engine
            .ingest_chunk(0xAB, header(1, 1, 1), &record_payload(b"x"), |id, raw, _| {
                seen.push((id, ChunkHeader::decode_producer_id(raw)));
            })
            .unwrap();
        assert_eq!(seen, vec![(1, 0xAB)]);
    }
}
