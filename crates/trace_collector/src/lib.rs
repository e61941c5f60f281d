//! trace_collector - the service-side buffer engine
//!
//! Ingests committed chunks out of every producer's shared memory buffer,
//! copies them into central ring buffers, reassembles fragmented records in
//! per-writer order, and serves read cursors to consumers. Optionally
//! mirrors every ingested chunk into a framed output file.
//!
//! Everything in this crate is designed to be owned by the single service
//! task: plain counters, no locks, `&mut` everywhere.

mod buffer;
mod clock;
mod engine;
mod file_sink;
mod reassembly;
mod records;

pub use buffer::{BufferStats, FillPolicy, InsertOutcome, TraceBuffer};
pub use clock::{clock_snapshot, ClockSnapshot};
pub use engine::{BufferEngine, DrainSummary, IngestError};
pub use file_sink::{read_trace_file, FileSink, TraceFileContents};
pub use records::{BufferStatsSnapshot, Record, RecordKind, ServiceMetadata, SessionStatus};
