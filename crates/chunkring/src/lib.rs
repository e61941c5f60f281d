//! chunkring - Shared Memory ABI for the tracering producer/service ring
//!
//! One producer process and the tracing service share a mapped byte region
//! (the SMB). The region is carved into pages, pages into chunks; every
//! chunk is owned at any instant by exactly one side. Ownership moves
//! through a 2-bit state machine packed into one atomic word per page, so
//! the two processes synchronize without any cross-process lock.
//!
//! # Key pieces
//!
//! - [`SmbConfig`] / [`PageLayout`]: region and page geometry
//! - [`ChunkHeader`]: the 16-byte per-chunk wire contract
//! - [`Smb`]: typed view over the shared region; the only verbs it exposes
//!   are acquire/complete (writer side) and begin-read/release (service
//!   side)
//!
//! # Example
//!
//! ```
//! use chunkring::{ChunkFlags, ChunkHeader, PageLayout, Smb, SmbConfig};
//! use std::sync::Arc;
//!
//! let smb = Arc::new(Smb::in_process(SmbConfig::default()));
//! assert!(smb.try_acquire_page(0, PageLayout::Four));
//!
//! // Writer side: claim chunk 0, fill it, publish it.
//! let mut chunk = smb.try_acquire_chunk(0, 0).unwrap();
//! chunk.write_header(&ChunkHeader {
//!     writer_id: 1,
//!     chunk_id: 1,
//!     packet_count: 0,
//!     flags: ChunkFlags::none(),
//!     target_buffer: 0,
//! });
//! chunk.complete().unwrap();
//!
//! // Service side: take ownership, copy out, hand the slot back.
//! let view = smb.try_begin_read(0, 0).unwrap();
//! assert_eq!(view.header().writer_id, 1);
//! view.release().unwrap();
//! ```

mod bitmap;
mod fragment;
mod header;
mod invariants;
mod layout;
mod page;
mod smb;

pub use bitmap::PageBitmap;
pub use fragment::{
    parse_fragments, FragmentError, FRAGMENT_PREFIX_LEN, FRAGMENT_TERMINATOR,
    MIN_FRAGMENT_HEADROOM,
};
pub use header::{BufferId, ChunkFlags, ChunkHeader, ProducerId, WriterId};
pub use layout::{PageLayout, SmbConfig, CHUNK_HEADER_LEN, PAGE_HEADER_WORD_LEN};
pub use page::{ChunkState, PageSnapshot};
pub use smb::{ServiceChunk, Smb, WriterChunk};

use thiserror::Error;

/// Errors raised by the shared-memory ABI.
///
/// `InvalidTransition` is the protocol-violation class: observing one means
/// the peer broke the ownership contract and the whole SMB must be torn
/// down. The other variants are construction-time failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AbiError {
    /// Page size not a power of two in 4-32 KiB, or zero pages.
    #[error("invalid SMB geometry: page_size={page_size} num_pages={num_pages}")]
    BadGeometry { page_size: usize, num_pages: usize },

    /// The provided region cannot hold the configured geometry.
    #[error("region too small: need {needed} bytes, got {actual}")]
    RegionTooSmall { needed: usize, actual: usize },

    /// The provided region base is not 8-byte aligned.
    #[error("region base not aligned to page header word")]
    MisalignedRegion,

    /// A chunk was observed in a state that forbids the attempted
    /// transition. Fatal to the SMB.
    #[error(
        "illegal chunk transition on page {page} chunk {chunk}: {from:?} -> {to:?}"
    )]
    InvalidTransition {
        page: usize,
        chunk: usize,
        from: ChunkState,
        to: ChunkState,
    },
}
