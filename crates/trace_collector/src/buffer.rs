//! Central trace buffers: rings of chunk-sized slots.
//!
//! A buffer owns its copied chunks (slots), the read cursor over them, and
//! the per-sequence reassembly state of every writer that targets it.
//! Reading never frees slots - eviction is driven purely by incoming
//! chunks - so a slow consumer loses data to the ring, never stalls a
//! producer.

use crate::reassembly::SequenceState;
use crate::records::{BufferStatsSnapshot, Record};
use chunkring::{parse_fragments, BufferId, ChunkHeader, ProducerId, WriterId, CHUNK_HEADER_LEN};
use std::collections::{HashMap, VecDeque};

/// What happens when a chunk arrives at a full buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillPolicy {
    /// Evict the oldest slot to make room.
    RingBuffer,
    /// Drop the incoming chunk.
    Discard,
}

/// Per-buffer counters. Plain u64: buffers live on the service loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub bytes_written: u64,
    pub bytes_lost: u64,
    pub chunks_committed: u64,
    pub chunks_lost: u64,
    pub records_lost: u64,
    pub writer_sequence_gaps: u64,
}

/// One copied chunk: the sanitized header plus its payload bytes.
struct Slot {
    seq: u64,
    producer_id: ProducerId,
    header: ChunkHeader,
    payload: Box<[u8]>,
}

impl Slot {
    fn size_bytes(&self) -> usize {
        CHUNK_HEADER_LEN + self.payload.len()
    }
}

/// Whether an incoming chunk was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Stored,
    Discarded,
}

/// A central ring buffer of chunk slots.
pub struct TraceBuffer {
    id: BufferId,
    capacity_bytes: usize,
    policy: FillPolicy,
    slots: VecDeque<Slot>,
    used_bytes: usize,
    /// Sequence number stamped on the next stored slot.
    next_seq: u64,
    /// Sequence number of the next slot the reader will visit.
    read_seq: u64,
    sequences: HashMap<(ProducerId, WriterId), SequenceState>,
    stats: BufferStats,
}

impl TraceBuffer {
    /// Creates a buffer. `capacity_bytes` is the configured quota, already
    /// rounded down to a chunk-size multiple by config validation.
    pub fn new(id: BufferId, capacity_bytes: usize, policy: FillPolicy) -> TraceBuffer {
        TraceBuffer {
            id,
            capacity_bytes,
            policy,
            slots: VecDeque::new(),
            used_bytes: 0,
            next_seq: 0,
            read_seq: 0,
            sequences: HashMap::new(),
            stats: BufferStats::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    #[inline]
    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    #[inline]
    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> BufferStatsSnapshot {
        BufferStatsSnapshot {
            buffer_id: self.id,
            bytes_written: self.stats.bytes_written,
            chunks_committed: self.stats.chunks_committed,
            chunks_lost: self.stats.chunks_lost,
            records_lost: self.stats.records_lost,
            writer_sequence_gaps: self.stats.writer_sequence_gaps,
        }
    }

    /// Copies one committed chunk into the ring.
    pub fn insert(
        &mut self,
        producer_id: ProducerId,
        header: ChunkHeader,
        payload: &[u8],
    ) -> InsertOutcome {
        let size = CHUNK_HEADER_LEN + payload.len();
        if size > self.capacity_bytes {
            self.stats.chunks_lost += 1;
            self.stats.bytes_lost += size as u64;
            self.stats.records_lost += u64::from(header.packet_count);
            return InsertOutcome::Discarded;
        }

        while self.used_bytes + size > self.capacity_bytes {
            match self.policy {
                FillPolicy::RingBuffer => self.evict_oldest(),
                FillPolicy::Discard => {
                    self.stats.chunks_lost += 1;
                    self.stats.bytes_lost += size as u64;
                    self.stats.records_lost += u64::from(header.packet_count);
                    return InsertOutcome::Discarded;
                }
            }
        }

        self.stats.bytes_written += size as u64;
        self.stats.chunks_committed += 1;
        self.used_bytes += size;
        self.slots.push_back(Slot {
            seq: self.next_seq,
            producer_id,
            header,
            payload: payload.into(),
        });
        self.next_seq += 1;
        InsertOutcome::Stored
    }

    fn evict_oldest(&mut self) {
        let slot = self.slots.pop_front().expect("evict from empty ring");
        self.used_bytes -= slot.size_bytes();
        if slot.seq >= self.read_seq {
            // Never delivered: the chunk and its contained records are
            // gone. Records spanning it are caught by the reader's gap
            // detection, armed here.
            self.stats.chunks_lost += 1;
            self.stats.bytes_lost += slot.size_bytes() as u64;
            self.stats.records_lost += u64::from(slot.header.packet_count);
            self.sequences
                .entry((slot.producer_id, slot.header.writer_id))
                .or_default()
                .mark_gap();
        }
    }

    /// Reads up to `max` reassembled records, advancing the cursor.
    /// Returns true if more records may be available right now.
    pub fn read_records(&mut self, max: usize, out: &mut Vec<Record>) -> bool {
        while out.len() < max {
            // Already-read slots form a prefix of the deque (reads never
            // remove, evictions only shorten from the front).
            let Some(idx) = self.slots.iter().position(|s| s.seq >= self.read_seq) else {
                self.read_seq = self.next_seq;
                break;
            };
            let slot = &self.slots[idx];
            self.read_seq = slot.seq + 1;

            let fragments = match parse_fragments(&slot.payload) {
                Ok(f) => f,
                // Validated at ingestion; a parse failure here means slot
                // corruption on our side, worth a loud log but not a loop
                // abort.
                Err(e) => {
                    tracing::error!(buffer = self.id, error = %e, "corrupt slot payload");
                    continue;
                }
            };
            let state = self
                .sequences
                .entry((slot.producer_id, slot.header.writer_id))
                .or_default();
            let outcome = state.consume_slot(
                slot.producer_id,
                slot.header.writer_id,
                slot.header.chunk_id,
                slot.header.flags,
                &fragments,
            );
            self.stats.records_lost += outcome.records_lost;
            self.stats.writer_sequence_gaps += outcome.gaps;
            out.extend(outcome.records);
        }
        self.slots.back().is_some_and(|s| s.seq >= self.read_seq)
    }

    /// Drops reassembly state for a departed producer. Pending fragments
    /// of its open records will never complete.
    pub fn forget_producer(&mut self, producer_id: ProducerId) {
        self.sequences.retain(|(p, _), _| *p != producer_id);
    }
}
