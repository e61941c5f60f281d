//! The per-thread record writer.
//!
//! A [`RecordWriter`] turns an append-only byte stream into length-prefixed
//! fragments inside chunks, spilling across chunks (and pages) as records
//! outgrow the space, and stamping the continuation flags and consecutive
//! chunk ids the service needs to reassemble. One writer belongs to one
//! thread; a data source that writes from several threads creates several
//! writers, each with its own id.
//!
//! Chunk acquisition order and the stall policies are described on
//! [`Arbiter`] and [`StallPolicy`].

use crate::{Arbiter, WriterError};
use chunkring::{
    BufferId, ChunkFlags, ChunkHeader, WriterChunk, WriterId, FRAGMENT_PREFIX_LEN,
    FRAGMENT_TERMINATOR, MIN_FRAGMENT_HEADROOM,
};
use std::time::{Duration, Instant};

/// What a writer does when no chunk can be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallPolicy {
    /// Truncate the in-flight record, count it lost, and turn appends into
    /// no-ops until the next record begins.
    Drop,
    /// Block (adaptive backoff) until a chunk frees or the timeout
    /// elapses; on timeout fall back to Drop semantics and surface
    /// [`WriterError::StallTimeout`] once.
    Stall { timeout: Duration },
}

/// Loss and throughput counters for one writer. Plain u64: the writer is
/// single-threaded, snapshots are taken through `&self`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub records_committed: u64,
    pub records_dropped: u64,
    pub bytes_dropped: u64,
    pub chunks_committed: u64,
    pub stall_timeouts: u64,
}

struct OpenChunk {
    view: WriterChunk,
    header: ChunkHeader,
    /// Next free payload byte.
    pos: usize,
    /// Offset of the open fragment's length prefix, if a fragment is open.
    fragment_start: Option<usize>,
    /// Bytes written into the open fragment so far.
    fragment_len: usize,
}

/// Append-only record writer over one writer sequence.
pub struct RecordWriter {
    arbiter: Arbiter,
    writer_id: WriterId,
    target_buffer: BufferId,
    policy: StallPolicy,
    payload_capacity: usize,
    chunk: Option<OpenChunk>,
    /// Position of the last sealed chunk, the adjacency hint for the next
    /// acquisition.
    prev_chunk: Option<(usize, usize)>,
    next_chunk_id: u32,
    record_open: bool,
    /// The open record already has fragments in sealed chunks.
    record_spans: bool,
    /// The open record is being discarded (allocation failed).
    dropping: bool,
    stats: WriterStats,
}

impl Arbiter {
    /// Creates a writer bound to `target_buffer` with the given stall
    /// policy. Fails only when all 65535 writer ids of this SMB are in use.
    pub fn create_writer(
        &self,
        target_buffer: BufferId,
        policy: StallPolicy,
    ) -> Result<RecordWriter, WriterError> {
        let writer_id = self.allocate_writer_id()?;
        Ok(RecordWriter {
            arbiter: self.clone(),
            writer_id,
            target_buffer,
            policy,
            payload_capacity: self.chunk_payload_size(),
            chunk: None,
            prev_chunk: None,
            next_chunk_id: 1,
            record_open: false,
            record_spans: false,
            dropping: false,
            stats: WriterStats::default(),
        })
    }
}

impl RecordWriter {
    #[inline]
    pub fn writer_id(&self) -> WriterId {
        self.writer_id
    }

    #[inline]
    pub fn target_buffer(&self) -> BufferId {
        self.target_buffer
    }

    /// Snapshot of the loss/throughput counters.
    #[inline]
    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    /// Opens a record. The returned guard must see exactly one
    /// [`RecordGuard::finalize`]; dropping the guard finalizes implicitly.
    pub fn begin_record(&mut self) -> RecordGuard<'_> {
        debug_assert!(!self.record_open, "previous record not finalized");
        self.record_open = true;
        self.record_spans = false;
        self.dropping = false;
        RecordGuard {
            writer: self,
            finalized: false,
        }
    }

    /// Seals and commits the current chunk (if any), then asks the service
    /// to drain everything this writer committed. Safe to call mid-record:
    /// the open record continues into the next chunk it touches.
    pub fn flush(&mut self) -> Result<(), WriterError> {
        if self.chunk.is_some() {
            let continues = self.record_open;
            self.seal_chunk(continues)?;
            if self.record_open {
                self.record_spans = true;
            }
        }
        self.arbiter.request_flush(self.writer_id);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Record plumbing (driven by RecordGuard)
    // ---------------------------------------------------------------------

    fn append_bytes(&mut self, bytes: &[u8]) -> Result<(), WriterError> {
        debug_assert!(self.record_open, "append outside a record");
        if self.dropping {
            self.stats.bytes_dropped += bytes.len() as u64;
            return Ok(());
        }
        if let Err(e) = self.ensure_fragment() {
            self.stats.bytes_dropped += bytes.len() as u64;
            return Err(e);
        }
        if self.dropping {
            self.stats.bytes_dropped += bytes.len() as u64;
            return Ok(());
        }

        let mut written = 0;
        while written < bytes.len() {
            let space = {
                let chunk = self.chunk.as_ref().expect("fragment open without chunk");
                self.payload_capacity - chunk.pos
            };
            if space == 0 {
                // Spill: close this chunk's fragment, mark the record as
                // continuing, and start a new fragment in the next chunk.
                self.seal_chunk(true)?;
                self.record_spans = true;
                match self.acquire_chunk() {
                    Ok(true) => self.open_fragment(),
                    Ok(false) => {
                        self.stats.bytes_dropped += (bytes.len() - written) as u64;
                        return Ok(());
                    }
                    Err(e) => {
                        self.stats.bytes_dropped += (bytes.len() - written) as u64;
                        return Err(e);
                    }
                }
                continue;
            }
            let n = space.min(bytes.len() - written);
            let chunk = self.chunk.as_mut().expect("fragment open without chunk");
            chunk.view.payload_mut()[chunk.pos..chunk.pos + n]
                .copy_from_slice(&bytes[written..written + n]);
            chunk.pos += n;
            chunk.fragment_len += n;
            written += n;
        }
        Ok(())
    }

    fn finalize_record(&mut self) -> Result<(), WriterError> {
        debug_assert!(self.record_open, "finalize outside a record");
        self.record_open = false;
        if self.dropping {
            self.stats.records_dropped += 1;
            return Ok(());
        }

        // A record that never appended (or whose tail landed exactly on a
        // flush) still needs a closing fragment so the service sees its
        // final boundary.
        if self
            .chunk
            .as_ref()
            .map_or(true, |c| c.fragment_start.is_none())
        {
            if let Err(e) = self.ensure_fragment() {
                self.stats.records_dropped += 1;
                return Err(e);
            }
            if self.dropping {
                self.stats.records_dropped += 1;
                return Ok(());
            }
        }

        self.patch_fragment();
        if !self.record_spans {
            let chunk = self.chunk.as_mut().expect("fragment patched without chunk");
            chunk.header.packet_count += 1;
        }
        self.stats.records_committed += 1;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Chunk plumbing
    // ---------------------------------------------------------------------

    /// Makes sure a fragment is open for the current record, sealing a
    /// too-full chunk and acquiring a new one as needed. Sets `dropping`
    /// (Drop policy) or returns `StallTimeout` (Stall policy) on failure.
    fn ensure_fragment(&mut self) -> Result<(), WriterError> {
        if self
            .chunk
            .as_ref()
            .is_some_and(|c| c.fragment_start.is_some())
        {
            return Ok(());
        }
        let too_full = self
            .chunk
            .as_ref()
            .is_some_and(|c| c.pos + MIN_FRAGMENT_HEADROOM > self.payload_capacity);
        if too_full {
            // No record bytes in flight here (no open fragment), so the
            // chunk seals without a continuation mark.
            self.seal_chunk(false)?;
        }
        if self.chunk.is_none() && !self.acquire_chunk()? {
            return Ok(());
        }
        self.open_fragment();
        Ok(())
    }

    /// Acquires the next chunk of this writer's sequence. `Ok(false)` means
    /// the record is now dropping (Drop policy exhausted the SMB).
    fn acquire_chunk(&mut self) -> Result<bool, WriterError> {
        let deadline = match self.policy {
            StallPolicy::Drop => None,
            StallPolicy::Stall { timeout } => Some(Instant::now() + timeout),
        };
        match self.arbiter.acquire_chunk(self.prev_chunk, deadline) {
            Some(view) => {
                let mut flags = ChunkFlags::none();
                // record_spans is only ever true between a spill (or a
                // mid-record flush) and the record's finalize, so this
                // chunk's first fragment is that record's continuation.
                if self.record_spans {
                    flags.set_continues_from_prev();
                }
                let header = ChunkHeader {
                    writer_id: self.writer_id,
                    chunk_id: self.next_chunk_id,
                    packet_count: 0,
                    flags,
                    target_buffer: self.target_buffer,
                };
                self.next_chunk_id += 1;
                self.chunk = Some(OpenChunk {
                    view,
                    header,
                    pos: 0,
                    fragment_start: None,
                    fragment_len: 0,
                });
                Ok(true)
            }
            None => {
                self.dropping = true;
                match self.policy {
                    StallPolicy::Stall { .. } => {
                        self.stats.stall_timeouts += 1;
                        Err(WriterError::StallTimeout)
                    }
                    StallPolicy::Drop => Ok(false),
                }
            }
        }
    }

    /// Writes the placeholder length prefix for a new fragment.
    fn open_fragment(&mut self) {
        let chunk = self.chunk.as_mut().expect("open_fragment without chunk");
        debug_assert!(chunk.fragment_start.is_none());
        debug_assert!(chunk.pos + MIN_FRAGMENT_HEADROOM <= self.payload_capacity);
        let pos = chunk.pos;
        chunk.view.payload_mut()[pos..pos + FRAGMENT_PREFIX_LEN].fill(0);
        chunk.fragment_start = Some(pos);
        chunk.fragment_len = 0;
        chunk.pos += FRAGMENT_PREFIX_LEN;
    }

    /// Backpatches the open fragment's length prefix, closing it.
    fn patch_fragment(&mut self) {
        let chunk = self.chunk.as_mut().expect("patch_fragment without chunk");
        if let Some(start) = chunk.fragment_start.take() {
            let len = (chunk.fragment_len as u32).to_le_bytes();
            chunk.view.payload_mut()[start..start + FRAGMENT_PREFIX_LEN].copy_from_slice(&len);
        }
    }

    /// Closes the open fragment, stamps the final header (with the
    /// continuation mark when the open record spills onward), terminates
    /// the fragment stream, and publishes the chunk.
    fn seal_chunk(&mut self, record_continues: bool) -> Result<(), WriterError> {
        if self
            .chunk
            .as_ref()
            .is_some_and(|c| c.fragment_start.is_some())
        {
            self.patch_fragment();
        }
        let mut chunk = self.chunk.take().expect("seal without chunk");
        if record_continues {
            chunk.header.flags.set_continues_into_next();
        }
        if chunk.pos + FRAGMENT_PREFIX_LEN <= self.payload_capacity {
            let pos = chunk.pos;
            chunk.view.payload_mut()[pos..pos + FRAGMENT_PREFIX_LEN]
                .copy_from_slice(&FRAGMENT_TERMINATOR.to_le_bytes());
        }
        chunk.view.write_header(&chunk.header);
        let page = chunk.view.page();
        self.prev_chunk = Some((page, chunk.view.chunk_index()));
        chunk.view.complete()?;
        self.stats.chunks_committed += 1;
        self.arbiter.record_commit(page);
        Ok(())
    }
}

impl Drop for RecordWriter {
    fn drop(&mut self) {
        // Publish whatever was committed so far; an open record is marked
        // continuing and will be counted lost by the service when its tail
        // never arrives - same as a crashed writer.
        if self.chunk.is_some() {
            let continues = self.record_open;
            let _ = self.seal_chunk(continues);
        }
        self.arbiter.free_writer_id(self.writer_id);
    }
}

/// Open record handle. Append bytes, then finalize exactly once; dropping
/// the guard finalizes implicitly (losses are visible in the stats, not as
/// a panic).
pub struct RecordGuard<'a> {
    writer: &'a mut RecordWriter,
    finalized: bool,
}

impl RecordGuard<'_> {
    /// Appends bytes to the record, spilling across chunks as needed.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), WriterError> {
        self.writer.append_bytes(bytes)
    }

    /// Flushes mid-record: everything written so far is published and the
    /// record continues in the next chunk it touches. Needed when a flush
    /// request lands while this thread is inside a long record.
    pub fn flush(&mut self) -> Result<(), WriterError> {
        self.writer.flush()
    }

    /// Closes the record. After this the record is either fully inside
    /// committed-or-open chunks, or counted in `records_dropped`.
    pub fn finalize(mut self) -> Result<(), WriterError> {
        self.finalized = true;
        self.writer.finalize_record()
    }
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        if !self.finalized {
            let _ = self.writer.finalize_record();
        }
    }
}
