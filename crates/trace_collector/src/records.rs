//! Consumer-visible record types and the synthesized service metadata.

use chunkring::{ProducerId, WriterId};
use serde::{Deserialize, Serialize};

/// What a record in the consumer stream is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    /// Produced by a data source; payload is opaque to the service.
    Data,
    /// Synthesized by the service at each flush; payload is a bincode
    /// [`ServiceMetadata`].
    ServiceMetadata,
}

/// One reassembled record as delivered by `ReadBuffers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub producer_id: ProducerId,
    pub writer_id: WriterId,
    pub kind: RecordKind,
    pub payload: Vec<u8>,
}

impl Record {
    /// Wraps a metadata blob as a stream record. Metadata records carry no
    /// producer/writer identity.
    pub fn metadata(meta: &ServiceMetadata) -> Record {
        Record {
            producer_id: 0,
            writer_id: 0,
            kind: RecordKind::ServiceMetadata,
            payload: bincode::serialize(meta).expect("metadata serializes"),
        }
    }
}

/// Health of a session as reported in metadata records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Ok,
    Degraded { loss_bytes: u64, loss_records: u64 },
    Aborted { reason: String },
}

/// Per-buffer counters as serialized into metadata records and the file
/// footer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStatsSnapshot {
    pub buffer_id: u16,
    pub bytes_written: u64,
    pub chunks_committed: u64,
    pub chunks_lost: u64,
    pub records_lost: u64,
    pub writer_sequence_gaps: u64,
}

/// The service metadata record synthesized once per flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMetadata {
    pub session_id: u64,
    pub flush_id: u64,
    /// Clock pair at this flush.
    pub wall_clock_ns: u64,
    pub boot_clock_ns: u64,
    /// Clock pair at session start, repeated in every metadata record so
    /// any single record suffices to correlate embedded timestamps.
    pub start_wall_clock_ns: u64,
    pub start_boot_clock_ns: u64,
    /// False when the flush deadline expired before every producer acked;
    /// the in-trace diagnostic for an incomplete flush.
    pub flush_complete: bool,
    pub status: SessionStatus,
    pub buffer_stats: Vec<BufferStatsSnapshot>,
}
