//! The arbiter: multi-writer coordination over one shared memory buffer.
//!
//! Every producer process has exactly one arbiter per SMB. It hands out
//! writer ids, arbitrates page/chunk acquisition between the process's
//! writer threads (purely through the atomic page headers - the arbiter
//! itself holds no lock while a writer touches chunk memory), and batches
//! commit signals into a changed-pages bitmap for the connection layer to
//! ship to the service.

use crate::backoff::DeadlineBackoff;
use crate::WriterError;
use chunkring::{PageBitmap, PageLayout, Smb, WriterChunk, WriterId};
use crossbeam_utils::CachePadded;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Receives commit and flush signals from writers.
///
/// Implementations forward these over the producer connection. They are
/// advisory: the service periodically re-scans the SMB anyway, so a lost
/// notification costs latency, never data.
pub trait CommitListener: Send + Sync {
    /// Chunks were completed in the pages named by `pages`. May be a
    /// superset of the pages that actually changed.
    fn on_pages_changed(&self, pages: &PageBitmap);

    /// A writer finished flushing its committed chunks and wants the
    /// service to drain them.
    fn on_flush(&self, writer_id: WriterId);
}

/// A listener that drops every signal. Useful in tests that drive the
/// service scan by hand.
#[derive(Debug, Default)]
pub struct NullListener;

impl CommitListener for NullListener {
    fn on_pages_changed(&self, _pages: &PageBitmap) {}
    fn on_flush(&self, _writer_id: WriterId) {}
}

/// Round-robin writer-id allocator. Ids are 1-based (0 is reserved as the
/// invalid writer) and freed ids are reused, oldest-allocated first.
struct WriterIdAllocator {
    last: WriterId,
    in_use: Vec<bool>,
}

impl WriterIdAllocator {
    const MAX_ID: WriterId = WriterId::MAX;

    fn new() -> Self {
        Self {
            last: 0,
            in_use: vec![false; 1],
        }
    }

    fn allocate(&mut self) -> Option<WriterId> {
        for _ in 0..Self::MAX_ID {
            self.last = if self.last < Self::MAX_ID { self.last + 1 } else { 1 };
            let id = self.last as usize;
            if id >= self.in_use.len() {
                self.in_use.resize(id + 1, false);
            }
            if !self.in_use[id] {
                self.in_use[id] = true;
                return Some(self.last);
            }
        }
        None
    }

    fn free(&mut self, id: WriterId) {
        let idx = id as usize;
        debug_assert!(id != 0 && idx < self.in_use.len() && self.in_use[idx]);
        if let Some(slot) = self.in_use.get_mut(idx) {
            *slot = false;
        }
    }
}

struct ArbiterInner {
    smb: Arc<Smb>,
    layout: PageLayout,
    /// Touched rarely (writer create/destroy).
    ids: CachePadded<Mutex<WriterIdAllocator>>,
    /// Touched on every chunk commit, by every writer thread.
    dirty: CachePadded<Mutex<PageBitmap>>,
    listener: Arc<dyn CommitListener>,
}

/// Cloneable handle to the per-SMB arbiter.
#[derive(Clone)]
pub struct Arbiter {
    inner: Arc<ArbiterInner>,
}

impl Arbiter {
    /// Creates the arbiter for `smb`. All pages this arbiter stamps use
    /// `layout`, so every chunk in the SMB has the same size - which is
    /// what lets central buffer slots be fixed-size.
    pub fn new(smb: Arc<Smb>, layout: PageLayout, listener: Arc<dyn CommitListener>) -> Arbiter {
        let num_pages = smb.num_pages();
        Arbiter {
            inner: Arc::new(ArbiterInner {
                smb,
                layout,
                ids: CachePadded::new(Mutex::new(WriterIdAllocator::new())),
                dirty: CachePadded::new(Mutex::new(PageBitmap::with_pages(num_pages))),
                listener,
            }),
        }
    }

    /// The SMB this arbiter manages.
    pub fn smb(&self) -> &Arc<Smb> {
        &self.inner.smb
    }

    /// The layout stamped on every page of this SMB.
    pub fn layout(&self) -> PageLayout {
        self.inner.layout
    }

    /// Payload bytes per chunk under this arbiter's layout.
    pub fn chunk_payload_size(&self) -> usize {
        self.inner.layout.payload_size(self.inner.smb.config().page_size())
    }

    pub(crate) fn allocate_writer_id(&self) -> Result<WriterId, WriterError> {
        self.inner
            .ids
            .lock()
            .expect("writer id allocator poisoned")
            .allocate()
            .ok_or(WriterError::TooManyWriters)
    }

    pub(crate) fn free_writer_id(&self, id: WriterId) {
        self.inner
            .ids
            .lock()
            .expect("writer id allocator poisoned")
            .free(id);
    }

    /// One pass over the SMB looking for a claimable chunk.
    ///
    /// Order of preference: the chunk after `prev` in the same page (keep a
    /// writer's fragments adjacent), then any free chunk in an
    /// already-stamped page (finish partially-used pages first), then a
    /// fully free page stamped fresh.
    fn try_acquire_once(&self, prev: Option<(usize, usize)>) -> Option<WriterChunk> {
        let smb = &self.inner.smb;
        let layout = self.inner.layout;

        if let Some((page, chunk)) = prev {
            for i in chunk + 1..layout.chunk_count() {
                if let Some(c) = smb.try_acquire_chunk(page, i) {
                    return Some(c);
                }
            }
        }

        for page in 0..smb.num_pages() {
            let snap = smb.snapshot_page(page);
            if snap.layout() == Some(layout) {
                for i in 0..layout.chunk_count() {
                    if snap.chunk_state(i) == chunkring::ChunkState::Free {
                        if let Some(c) = smb.try_acquire_chunk(page, i) {
                            return Some(c);
                        }
                    }
                }
            }
        }

        if let Some(page) = smb.try_acquire_any_page(layout) {
            if let Some(c) = smb.try_acquire_chunk(page, 0) {
                return Some(c);
            }
        }

        None
    }

    /// Acquires a chunk for a writer, retrying with adaptive backoff until
    /// `deadline` when one is given. `None` deadline is a single attempt
    /// (the DROP policy).
    pub(crate) fn acquire_chunk(
        &self,
        prev: Option<(usize, usize)>,
        deadline: Option<Instant>,
    ) -> Option<WriterChunk> {
        let mut backoff = DeadlineBackoff::new(deadline);
        loop {
            if let Some(chunk) = self.try_acquire_once(prev) {
                return Some(chunk);
            }
            if !backoff.wait() {
                return None;
            }
        }
    }

    /// Records that a chunk in `page` was completed, and signals the
    /// listener with everything accumulated since the last signal.
    pub(crate) fn record_commit(&self, page: usize) {
        let batch = {
            let mut dirty = self.inner.dirty.lock().expect("dirty bitmap poisoned");
            dirty.set(page);
            dirty.drain()
        };
        self.inner.listener.on_pages_changed(&batch);
    }

    /// Forwards a writer's flush request to the connection layer.
    pub(crate) fn request_flush(&self, writer_id: WriterId) {
        self.inner.listener.on_flush(writer_id);
    }
}
