//! The per-page header word and its atomic state machine.
//!
//! =============================================================================
//! MEMORY ORDERING & SYNCHRONIZATION STRATEGY
//! =============================================================================
//!
//! One 64-bit word per page carries everything the two processes agree on:
//!
//! ```text
//! bits 0..3    layout code (0 = unpartitioned, 1..=6 = PageLayout)
//! bits 3..35   chunk states, 2 bits per chunk, chunk i at bit 3 + 2*i
//! bits 35..64  zero
//! ```
//!
//! Every mutation is a single compare-and-swap on this word:
//!
//! - **Writer** performs Free->WriterOwned (acquire) and
//!   WriterOwned->Complete (publish). The Complete CAS uses Release so the
//!   payload bytes written before it are visible to the service.
//! - **Service** performs Complete->ServiceOwned (claim for copy-out) and
//!   ServiceOwned->Free (return the slot). The claim CAS uses Acquire to
//!   synchronize with the writer's Release; the return uses Release so the
//!   writer's subsequent acquire (Acquire) knows the service is done
//!   touching the payload.
//!
//! All CAS operations here use AcqRel/Acquire, which covers both directions
//! and keeps the table above easy to audit. The payload bytes themselves
//! need no atomics: ownership of a chunk is exclusive between a successful
//! acquire and the matching publish/return, and the CAS pair orders the
//! accesses across the process boundary.
//!
//! Any observed state that forbids the requested transition is a protocol
//! violation: the peer wrote to a word it did not own. That is fatal to the
//! SMB, never to the process.

use crate::invariants::debug_assert_transition_legal;
use crate::layout::PageLayout;
use crate::AbiError;
use std::sync::atomic::{AtomicU64, Ordering};

const LAYOUT_MASK: u64 = 0b111;
const STATE_BASE_SHIFT: u32 = 3;
const STATE_MASK: u64 = 0b11;

/// Ownership state of one chunk, 2 bits in the page header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChunkState {
    /// Nobody owns the chunk; a writer may claim it.
    Free = 0,
    /// A writer is filling the chunk.
    WriterOwned = 1,
    /// The writer published the chunk; the service may claim it.
    Complete = 2,
    /// The service is copying the chunk out.
    ServiceOwned = 3,
}

impl ChunkState {
    #[inline]
    pub(crate) fn from_bits(bits: u64) -> ChunkState {
        match bits & STATE_MASK {
            0 => ChunkState::Free,
            1 => ChunkState::WriterOwned,
            2 => ChunkState::Complete,
            _ => ChunkState::ServiceOwned,
        }
    }

    /// True if `self -> to` is one step of the ownership cycle
    /// Free -> WriterOwned -> Complete -> ServiceOwned -> Free.
    #[inline]
    pub fn can_transition_to(self, to: ChunkState) -> bool {
        matches!(
            (self, to),
            (ChunkState::Free, ChunkState::WriterOwned)
                | (ChunkState::WriterOwned, ChunkState::Complete)
                | (ChunkState::Complete, ChunkState::ServiceOwned)
                | (ChunkState::ServiceOwned, ChunkState::Free)
        )
    }
}

#[inline]
fn state_shift(chunk: usize) -> u32 {
    STATE_BASE_SHIFT + 2 * chunk as u32
}

#[inline]
pub(crate) fn layout_of(word: u64) -> Option<PageLayout> {
    PageLayout::from_code((word & LAYOUT_MASK) as u8)
}

#[inline]
pub(crate) fn state_of(word: u64, chunk: usize) -> ChunkState {
    ChunkState::from_bits(word >> state_shift(chunk))
}

#[inline]
fn with_state(word: u64, chunk: usize, state: ChunkState) -> u64 {
    let shift = state_shift(chunk);
    (word & !(STATE_MASK << shift)) | ((state as u64) << shift)
}

/// True if every chunk state in the word is Free, whatever the layout.
#[inline]
fn all_chunks_free(word: u64) -> bool {
    word >> STATE_BASE_SHIFT == 0
}

/// Decoded view of one page header word.
#[derive(Debug, Clone, Copy)]
pub struct PageSnapshot {
    layout: Option<PageLayout>,
    word: u64,
}

impl PageSnapshot {
    pub(crate) fn new(word: u64) -> PageSnapshot {
        PageSnapshot {
            layout: layout_of(word),
            word,
        }
    }

    /// The stamped layout, or `None` for an unpartitioned page.
    #[inline]
    pub fn layout(&self) -> Option<PageLayout> {
        self.layout
    }

    /// State of chunk `i`. Meaningless beyond the layout's chunk count.
    #[inline]
    pub fn chunk_state(&self, i: usize) -> ChunkState {
        state_of(self.word, i)
    }

    /// True if the page is fully free: either unpartitioned, or stamped
    /// with every chunk back in Free.
    #[inline]
    pub fn is_free(&self) -> bool {
        all_chunks_free(self.word)
    }

    /// Indices of chunks currently in the Complete state.
    pub fn complete_chunks(&self) -> impl Iterator<Item = usize> + '_ {
        let count = self.layout.map_or(0, PageLayout::chunk_count);
        (0..count).filter(move |&i| self.chunk_state(i) == ChunkState::Complete)
    }
}

/// Stamps `layout` on a fully free page. A page whose previous partitioning
/// drained back to all-Free may be re-stamped with a different layout; the
/// CAS makes the drain check and the stamp one atomic step.
pub(crate) fn try_acquire_page(word: &AtomicU64, layout: PageLayout) -> bool {
    let mut cur = word.load(Ordering::Acquire);
    loop {
        if !all_chunks_free(cur) {
            return false;
        }
        let new = u64::from(layout.code());
        match word.compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return true,
            Err(observed) => cur = observed,
        }
    }
}

/// Free -> WriterOwned on chunk `chunk`. Returns false if the page is
/// unpartitioned, the index is out of range for the stamped layout, or the
/// chunk is not Free. Contention here is normal, not a violation.
pub(crate) fn try_acquire_chunk(word: &AtomicU64, chunk: usize) -> bool {
    let mut cur = word.load(Ordering::Acquire);
    loop {
        let Some(layout) = layout_of(cur) else {
            return false;
        };
        if chunk >= layout.chunk_count() {
            return false;
        }
        if state_of(cur, chunk) != ChunkState::Free {
            return false;
        }
        debug_assert_transition_legal!(ChunkState::Free, ChunkState::WriterOwned);
        let new = with_state(cur, chunk, ChunkState::WriterOwned);
        match word.compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return true,
            Err(observed) => cur = observed,
        }
    }
}

/// Complete -> ServiceOwned. Returns false if the chunk is in any other
/// state; the ingestion scan tolerates that (advisory notifications may
/// name unchanged pages).
pub(crate) fn try_begin_read(word: &AtomicU64, chunk: usize) -> bool {
    let mut cur = word.load(Ordering::Acquire);
    loop {
        let Some(layout) = layout_of(cur) else {
            return false;
        };
        if chunk >= layout.chunk_count() || state_of(cur, chunk) != ChunkState::Complete {
            return false;
        }
        debug_assert_transition_legal!(ChunkState::Complete, ChunkState::ServiceOwned);
        let new = with_state(cur, chunk, ChunkState::ServiceOwned);
        match word.compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return true,
            Err(observed) => cur = observed,
        }
    }
}

/// Performs `from -> to` on a chunk the caller already owns. Unlike the
/// try_* claims, finding the chunk in any state other than `from` means the
/// peer touched a word it did not own: fatal to the SMB.
pub(crate) fn owned_transition(
    word: &AtomicU64,
    page: usize,
    chunk: usize,
    from: ChunkState,
    to: ChunkState,
) -> Result<(), AbiError> {
    debug_assert_transition_legal!(from, to);
    let mut cur = word.load(Ordering::Acquire);
    loop {
        let observed = state_of(cur, chunk);
        if observed != from {
            return Err(AbiError::InvalidTransition {
                page,
                chunk,
                from: observed,
                to,
            });
        }
        let new = with_state(cur, chunk, to);
        match word.compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Ok(()),
            Err(w) => cur = w,
        }
    }
}
