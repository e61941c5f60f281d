//! Typed view over the shared memory region.
//!
//! [`Smb`] never hands out raw pointers. The writer side sees chunks only
//! as [`WriterChunk`] (claim -> fill -> `complete`), the service side only
//! as [`ServiceChunk`] (`try_begin_read` -> copy -> `release`). The page
//! state machine in `page.rs` guarantees the two views never address the
//! same chunk at the same time, which is what makes the `&mut [u8]` /
//! `&[u8]` payload borrows below sound across the process boundary.

use crate::invariants::{debug_assert_chunk_in_layout, debug_assert_in_region};
use crate::layout::{PageLayout, SmbConfig, CHUNK_HEADER_LEN, PAGE_HEADER_WORD_LEN};
use crate::page::{self, ChunkState, PageSnapshot};
use crate::{AbiError, ChunkHeader};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The shared memory buffer: one per producer connection.
///
/// Constructed either over an owned in-process allocation (tests, the
/// in-process transport) or, unsafely, over an externally mapped region.
pub struct Smb {
    base: *mut u8,
    cfg: SmbConfig,
    /// Keeps the in-process allocation alive; `None` for external regions.
    _backing: Option<Box<[UnsafeCell<u64>]>>,
}

// Safety: all shared mutation goes through the atomic page-header words;
// payload ranges are only reachable through WriterChunk/ServiceChunk, whose
// existence is serialized by the chunk state machine. See the ordering
// strategy in page.rs.
unsafe impl Send for Smb {}
unsafe impl Sync for Smb {}

impl Smb {
    /// Allocates a zeroed region in this process.
    pub fn in_process(cfg: SmbConfig) -> Smb {
        let words = cfg.total_len().div_ceil(PAGE_HEADER_WORD_LEN);
        let backing: Box<[UnsafeCell<u64>]> =
            (0..words).map(|_| UnsafeCell::new(0)).collect();
        let base = backing.as_ptr().cast::<u8>().cast_mut();
        Smb {
            base,
            cfg,
            _backing: Some(backing),
        }
    }

    /// Wraps an externally mapped region (e.g. a memfd mapping shared with
    /// the peer process).
    ///
    /// # Safety
    ///
    /// `base` must point to a region of at least `len` bytes that stays
    /// mapped and writable for the lifetime of the returned `Smb`, shared
    /// with at most one peer that follows this ABI. The header block must
    /// have been zero-initialized by whichever side created the mapping.
    pub unsafe fn from_raw_parts(
        base: *mut u8,
        len: usize,
        cfg: SmbConfig,
    ) -> Result<Smb, AbiError> {
        if base.align_offset(PAGE_HEADER_WORD_LEN) != 0 {
            return Err(AbiError::MisalignedRegion);
        }
        if len < cfg.total_len() {
            return Err(AbiError::RegionTooSmall {
                needed: cfg.total_len(),
                actual: len,
            });
        }
        Ok(Smb {
            base,
            cfg,
            _backing: None,
        })
    }

    /// The geometry this region was created with.
    #[inline]
    pub fn config(&self) -> &SmbConfig {
        &self.cfg
    }

    #[inline]
    pub fn num_pages(&self) -> usize {
        self.cfg.num_pages()
    }

    fn header_word(&self, page: usize) -> &AtomicU64 {
        assert!(page < self.cfg.num_pages(), "page index out of range");
        // SAFETY: the header block starts at `base` with one aligned u64
        // per page; the region outlives `self` and the word is only ever
        // accessed atomically.
        unsafe {
            let ptr = self.base.add(page * PAGE_HEADER_WORD_LEN).cast::<u64>();
            AtomicU64::from_ptr(ptr)
        }
    }

    /// Decoded state of one page header word.
    pub fn snapshot_page(&self, page: usize) -> PageSnapshot {
        PageSnapshot::new(self.header_word(page).load(Ordering::Acquire))
    }

    /// Atomically stamps `layout` on page `page` if it is fully free.
    pub fn try_acquire_page(&self, page: usize, layout: PageLayout) -> bool {
        page::try_acquire_page(self.header_word(page), layout)
    }

    /// Scans for a fully free page and stamps `layout` on the first one
    /// won. Returns the page index, or `None` if every page has an owned
    /// chunk somewhere.
    pub fn try_acquire_any_page(&self, layout: PageLayout) -> Option<usize> {
        (0..self.cfg.num_pages()).find(|&p| self.try_acquire_page(p, layout))
    }

    /// Claims chunk `chunk` of page `page` for writing (Free ->
    /// WriterOwned). `None` under contention or when the chunk is not free;
    /// both are normal. The returned view keeps the region alive, so a
    /// writer can hold it across arbitrary API calls.
    pub fn try_acquire_chunk(self: &Arc<Self>, page: usize, chunk: usize) -> Option<WriterChunk> {
        let word = self.header_word(page);
        if !page::try_acquire_chunk(word, chunk) {
            return None;
        }
        // The layout cannot change from under us: re-stamping requires
        // every chunk Free, and we hold one in WriterOwned.
        let layout = page::layout_of(word.load(Ordering::Relaxed))
            .expect("acquired chunk on unpartitioned page");
        let (offset, len) = self.chunk_range(page, chunk, layout);
        Some(WriterChunk {
            smb: Arc::clone(self),
            page,
            chunk,
            offset,
            len,
        })
    }

    /// Claims chunk `chunk` of page `page` for copy-out (Complete ->
    /// ServiceOwned). `None` when the chunk is not Complete; the ingestion
    /// scan treats that as "nothing to do" since notifications are
    /// advisory supersets.
    pub fn try_begin_read(self: &Arc<Self>, page: usize, chunk: usize) -> Option<ServiceChunk> {
        let word = self.header_word(page);
        if !page::try_begin_read(word, chunk) {
            return None;
        }
        let layout = page::layout_of(word.load(Ordering::Relaxed))
            .expect("began read on unpartitioned page");
        let (offset, len) = self.chunk_range(page, chunk, layout);
        Some(ServiceChunk {
            smb: Arc::clone(self),
            page,
            chunk,
            offset,
            len,
        })
    }

    fn chunk_range(&self, page: usize, chunk: usize, layout: PageLayout) -> (usize, usize) {
        debug_assert_chunk_in_layout!(chunk, layout.chunk_count());
        let chunk_size = layout.chunk_size(self.cfg.page_size());
        let offset = self.cfg.page_offset(page) + chunk * chunk_size;
        debug_assert_in_region!(offset, chunk_size, self.cfg.total_len());
        (offset, chunk_size)
    }

    /// # Safety: caller must own the chunk per the state machine.
    unsafe fn range_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.base.add(offset), len)
    }

    /// # Safety: caller must own the chunk per the state machine.
    unsafe fn range(&self, offset: usize, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.base.add(offset), len)
    }
}

/// A chunk in the WriterOwned state, exclusive to its creator.
///
/// Dropping without [`complete`](WriterChunk::complete) leaves the chunk
/// WriterOwned: the bytes are lost when the connection tears down, exactly
/// like a writer that crashed mid-chunk. That is deliberate - a chunk that
/// was partially filled must never become visible to the service.
pub struct WriterChunk {
    smb: Arc<Smb>,
    page: usize,
    chunk: usize,
    offset: usize,
    len: usize,
}

impl WriterChunk {
    #[inline]
    pub fn page(&self) -> usize {
        self.page
    }

    #[inline]
    pub fn chunk_index(&self) -> usize {
        self.chunk
    }

    /// Payload capacity after the chunk header.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.len - CHUNK_HEADER_LEN
    }

    /// Mutable view of the payload bytes.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: this chunk is WriterOwned by `self` (state machine), so
        // no other WriterChunk or ServiceChunk can address these bytes.
        unsafe {
            &mut self.smb.range_mut(self.offset, self.len)[CHUNK_HEADER_LEN..]
        }
    }

    /// (Re)writes the 16-byte chunk header. Called once when the chunk is
    /// opened and again just before `complete` to stamp the final
    /// `packet_count` and continuation flags.
    pub fn write_header(&mut self, header: &ChunkHeader) {
        let encoded = header.encode();
        // SAFETY: as for payload_mut; the header range is inside the
        // owned chunk.
        unsafe {
            self.smb.range_mut(self.offset, CHUNK_HEADER_LEN)
                .copy_from_slice(&encoded);
        }
    }

    /// Publishes the chunk to the service (WriterOwned -> Complete). The
    /// header must be fully populated first.
    pub fn complete(self) -> Result<(), AbiError> {
        page::owned_transition(
            self.smb.header_word(self.page),
            self.page,
            self.chunk,
            ChunkState::WriterOwned,
            ChunkState::Complete,
        )
    }
}

/// A chunk in the ServiceOwned state, readable by the service.
///
/// Dropping without [`release`](ServiceChunk::release) strands the chunk in
/// ServiceOwned until the SMB is torn down; the ingestion path always
/// releases, even for chunks it rejects.
pub struct ServiceChunk {
    smb: Arc<Smb>,
    page: usize,
    chunk: usize,
    offset: usize,
    len: usize,
}

impl ServiceChunk {
    #[inline]
    pub fn page(&self) -> usize {
        self.page
    }

    #[inline]
    pub fn chunk_index(&self) -> usize {
        self.chunk
    }

    /// The raw 16-byte header, as the writer left it.
    pub fn header_raw(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut out = [0u8; CHUNK_HEADER_LEN];
        // SAFETY: this chunk is ServiceOwned by `self`; the writer stopped
        // touching it at its Complete CAS.
        out.copy_from_slice(unsafe { self.smb.range(self.offset, CHUNK_HEADER_LEN) });
        out
    }

    /// Decoded header.
    pub fn header(&self) -> ChunkHeader {
        ChunkHeader::decode(&self.header_raw())
    }

    /// The payload bytes following the header.
    pub fn payload(&self) -> &[u8] {
        // SAFETY: as for header_raw.
        unsafe { &self.smb.range(self.offset, self.len)[CHUNK_HEADER_LEN..] }
    }

    /// Returns the slot to the writer side (ServiceOwned -> Free).
    pub fn release(self) -> Result<(), AbiError> {
        page::owned_transition(
            self.smb.header_word(self.page),
            self.page,
            self.chunk,
            ChunkState::ServiceOwned,
            ChunkState::Free,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChunkFlags;

    fn in_process(cfg: SmbConfig) -> Arc<Smb> {
        Arc::new(Smb::in_process(cfg))
    }

    fn test_header(chunk_id: u32) -> ChunkHeader {
        ChunkHeader {
            writer_id: 1,
            chunk_id,
            packet_count: 1,
            flags: ChunkFlags::none(),
            target_buffer: 0,
        }
    }

    #[test]
    fn write_then_read_round_trip() {
        let smb = in_process(SmbConfig::new(4096, 2).unwrap());
        assert!(smb.try_acquire_page(0, PageLayout::Four));

        let mut chunk = smb.try_acquire_chunk(0, 1).unwrap();
        assert_eq!(chunk.payload_len(), 1008);
        chunk.write_header(&test_header(42));
        chunk.payload_mut()[..4].copy_from_slice(&[9, 8, 7, 6]);
        chunk.complete().unwrap();

        let view = smb.try_begin_read(0, 1).unwrap();
        let header = view.header();
        assert_eq!(header.chunk_id, 42);
        assert_eq!(&view.payload()[..4], &[9, 8, 7, 6]);
        view.release().unwrap();

        // The slot is free again for the writer.
        assert!(smb.try_acquire_chunk(0, 1).is_some());
    }

    #[test]
    fn begin_read_needs_complete() {
        let smb = in_process(SmbConfig::default());
        assert!(smb.try_begin_read(0, 0).is_none(), "unpartitioned page");
        assert!(smb.try_acquire_page(0, PageLayout::Two));
        assert!(smb.try_begin_read(0, 0).is_none(), "free chunk");
        let chunk = smb.try_acquire_chunk(0, 0).unwrap();
        assert!(smb.try_begin_read(0, 0).is_none(), "writer-owned chunk");
        chunk.complete().unwrap();
        assert!(smb.try_begin_read(0, 0).is_some());
    }

    #[test]
    fn acquire_any_page_scans() {
        let smb = in_process(SmbConfig::new(4096, 3).unwrap());
        assert_eq!(smb.try_acquire_any_page(PageLayout::One), Some(0));
        // Page 0 still fully free (no chunk claimed): the scan restamps it.
        assert_eq!(smb.try_acquire_any_page(PageLayout::One), Some(0));
        let _c = smb.try_acquire_chunk(0, 0).unwrap();
        assert_eq!(smb.try_acquire_any_page(PageLayout::One), Some(1));
    }

    #[test]
    fn chunks_are_disjoint() {
        let smb = in_process(SmbConfig::new(4096, 1).unwrap());
        assert!(smb.try_acquire_page(0, PageLayout::Four));
        let mut a = smb.try_acquire_chunk(0, 0).unwrap();
        let mut b = smb.try_acquire_chunk(0, 3).unwrap();
        a.payload_mut().fill(0xAA);
        b.payload_mut().fill(0xBB);
        a.write_header(&test_header(1));
        b.write_header(&test_header(2));
        a.complete().unwrap();
        b.complete().unwrap();

        let a = smb.try_begin_read(0, 0).unwrap();
        let b = smb.try_begin_read(0, 3).unwrap();
        assert!(a.payload().iter().all(|&x| x == 0xAA));
        assert!(b.payload().iter().all(|&x| x == 0xBB));
        a.release().unwrap();
        b.release().unwrap();
    }

    #[test]
    fn from_raw_parts_validates_region() {
        let cfg = SmbConfig::new(4096, 1).unwrap();
        let mut backing = vec![0u64; cfg.total_len() / 8];
        let base = backing.as_mut_ptr().cast::<u8>();
        // SAFETY: the vec outlives the Smb inside this test.
        unsafe {
            assert!(Smb::from_raw_parts(base, cfg.total_len(), cfg).is_ok());
            assert!(matches!(
                Smb::from_raw_parts(base, 16, cfg),
                Err(AbiError::RegionTooSmall { .. })
            ));
            assert!(matches!(
                Smb::from_raw_parts(base.add(1), cfg.total_len(), cfg),
                Err(AbiError::MisalignedRegion)
            ));
        }
    }
}
