//! Page geometry: how an SMB is carved into pages, and pages into chunks.
//!
//! The shared region is laid out as a header block (one 64-bit word per
//! page, padded to a cache line boundary) followed by the pages themselves.
//! Keeping the header words out of line means every chunk of a page has the
//! same size, so `page_size / chunk_count` is exact for the power-of-two
//! divisions and the 7/14-way divisions simply leave the tail remainder
//! unused.

use crate::AbiError;

/// Size of the per-chunk header stamped at the start of every chunk.
pub const CHUNK_HEADER_LEN: usize = 16;

/// Bytes per page-header word in the SMB header block.
pub const PAGE_HEADER_WORD_LEN: usize = 8;

/// Alignment of the header block and of each page within the region.
const HEADER_BLOCK_ALIGN: usize = 64;

/// How a page is partitioned into chunks.
///
/// The discriminant is the 3-bit layout code stamped into the page header
/// word when the page leaves the unpartitioned state. Code 0 is reserved
/// for "unpartitioned"; it never appears as a `PageLayout` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageLayout {
    One = 1,
    Two = 2,
    Four = 3,
    Seven = 4,
    Fourteen = 5,
    Sixteen = 6,
}

impl PageLayout {
    /// All layouts, densest first. Used by scan helpers and tests.
    pub const ALL: [PageLayout; 6] = [
        PageLayout::One,
        PageLayout::Two,
        PageLayout::Four,
        PageLayout::Seven,
        PageLayout::Fourteen,
        PageLayout::Sixteen,
    ];

    /// Decodes a 3-bit layout code. Code 0 (unpartitioned) and codes 7+
    /// yield `None`.
    #[inline]
    pub fn from_code(code: u8) -> Option<PageLayout> {
        match code {
            1 => Some(PageLayout::One),
            2 => Some(PageLayout::Two),
            3 => Some(PageLayout::Four),
            4 => Some(PageLayout::Seven),
            5 => Some(PageLayout::Fourteen),
            6 => Some(PageLayout::Sixteen),
            _ => None,
        }
    }

    /// The 3-bit code for this layout.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Number of chunks a page with this layout is divided into.
    #[inline]
    pub fn chunk_count(self) -> usize {
        match self {
            PageLayout::One => 1,
            PageLayout::Two => 2,
            PageLayout::Four => 4,
            PageLayout::Seven => 7,
            PageLayout::Fourteen => 14,
            PageLayout::Sixteen => 16,
        }
    }

    /// Chunk size (header + payload) for a page of `page_size` bytes.
    ///
    /// Integer division; for the 7/14-way layouts the remainder at the end
    /// of the page is unused.
    #[inline]
    pub fn chunk_size(self, page_size: usize) -> usize {
        page_size / self.chunk_count()
    }

    /// Payload bytes available in one chunk after its header.
    #[inline]
    pub fn payload_size(self, page_size: usize) -> usize {
        self.chunk_size(page_size) - CHUNK_HEADER_LEN
    }
}

/// Geometry of one shared memory buffer, fixed at the producer handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmbConfig {
    page_size: usize,
    num_pages: usize,
}

impl SmbConfig {
    /// Smallest supported page size.
    pub const MIN_PAGE_SIZE: usize = 4 * 1024;
    /// Largest supported page size.
    pub const MAX_PAGE_SIZE: usize = 32 * 1024;

    /// Creates a geometry, validating that `page_size` is a power of two in
    /// `4 KiB..=32 KiB` and that there is at least one page.
    pub fn new(page_size: usize, num_pages: usize) -> Result<SmbConfig, AbiError> {
        if !page_size.is_power_of_two()
            || page_size < Self::MIN_PAGE_SIZE
            || page_size > Self::MAX_PAGE_SIZE
        {
            return Err(AbiError::BadGeometry {
                page_size,
                num_pages,
            });
        }
        if num_pages == 0 {
            return Err(AbiError::BadGeometry {
                page_size,
                num_pages,
            });
        }
        Ok(SmbConfig {
            page_size,
            num_pages,
        })
    }

    /// Derives a geometry from a total size in bytes, rounding the page
    /// count down until header block + pages fit. Fails if `total` does
    /// not fit a single page.
    pub fn for_total_size(total: usize, page_size: usize) -> Result<SmbConfig, AbiError> {
        let probe = SmbConfig::new(page_size, 1)?;
        let usable = total.saturating_sub(probe.header_block_len());
        let mut num_pages = usable / page_size;
        loop {
            let cfg = SmbConfig::new(page_size, num_pages)?;
            if cfg.total_len() <= total {
                return Ok(cfg);
            }
            // The header block outgrew the one-page estimate.
            num_pages -= 1;
        }
    }

    /// Page size in bytes.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages in the region.
    #[inline]
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Length of the header block: one 64-bit word per page, padded to a
    /// 64-byte boundary so page 0 never shares a cache line with a header.
    #[inline]
    pub fn header_block_len(&self) -> usize {
        let raw = self.num_pages * PAGE_HEADER_WORD_LEN;
        (raw + HEADER_BLOCK_ALIGN - 1) & !(HEADER_BLOCK_ALIGN - 1)
    }

    /// Byte offset of a page's first chunk within the region.
    #[inline]
    pub fn page_offset(&self, page: usize) -> usize {
        debug_assert!(page < self.num_pages);
        self.header_block_len() + page * self.page_size
    }

    /// Total region length: header block plus all pages.
    #[inline]
    pub fn total_len(&self) -> usize {
        self.header_block_len() + self.num_pages * self.page_size
    }
}

impl Default for SmbConfig {
    /// 4 KiB pages, 32 pages (128 KiB of chunk space).
    fn default() -> Self {
        SmbConfig {
            page_size: 4096,
            num_pages: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_codes_round_trip() {
        for layout in PageLayout::ALL {
            assert_eq!(PageLayout::from_code(layout.code()), Some(layout));
        }
        assert_eq!(PageLayout::from_code(0), None);
        assert_eq!(PageLayout::from_code(7), None);
    }

    #[test]
    fn chunk_geometry_for_4k_page() {
        // The 4-way division of a 4 KiB page: 1024-byte chunks, 1008 bytes
        // of payload after the 16-byte chunk header.
        assert_eq!(PageLayout::Four.chunk_size(4096), 1024);
        assert_eq!(PageLayout::Four.payload_size(4096), 1008);

        // 7-way division leaves a remainder unused.
        assert_eq!(PageLayout::Seven.chunk_size(4096), 585);
        assert_eq!(PageLayout::Sixteen.chunk_size(4096), 256);
    }

    #[test]
    fn config_rejects_bad_geometry() {
        assert!(SmbConfig::new(4096, 0).is_err());
        assert!(SmbConfig::new(1024, 4).is_err());
        assert!(SmbConfig::new(5000, 4).is_err());
        assert!(SmbConfig::new(64 * 1024, 4).is_err());
        assert!(SmbConfig::new(4096, 4).is_ok());
    }

    #[test]
    fn region_offsets_do_not_overlap() {
        let cfg = SmbConfig::new(4096, 3).unwrap();
        assert_eq!(cfg.header_block_len(), 64);
        assert_eq!(cfg.page_offset(0), 64);
        assert_eq!(cfg.page_offset(2), 64 + 2 * 4096);
        assert_eq!(cfg.total_len(), 64 + 3 * 4096);
    }

    #[test]
    fn config_from_total_size() {
        // 32 pages need a 256-byte header block (32 x 8).
        let cfg = SmbConfig::for_total_size(32 * 4096 + 256, 4096).unwrap();
        assert_eq!(cfg.num_pages(), 32);
        assert!(cfg.total_len() <= 32 * 4096 + 256);

        // A boundary total where the header estimate shrinks the count.
        let cfg = SmbConfig::for_total_size(128 * 1024 + 64, 4096).unwrap();
        assert_eq!(cfg.num_pages(), 31);
        assert!(cfg.total_len() <= 128 * 1024 + 64);

        assert!(SmbConfig::for_total_size(1024, 4096).is_err());
    }
}
