//! Debug assertion macros for ABI invariants.
//!
//! Active only in debug builds; release builds pay nothing. The service
//! never relies on these for correctness (a hostile producer runs a release
//! build anyway) - header validation at ingestion is the real gate. These
//! catch bugs on our side of the contract.

// =============================================================================
// INV-ABI-01: Chunk index within stamped layout
// =============================================================================

/// Assert a chunk index addresses a chunk that exists in the page layout.
macro_rules! debug_assert_chunk_in_layout {
    ($idx:expr, $count:expr) => {
        debug_assert!(
            $idx < $count,
            "INV-ABI-01 violated: chunk index {} outside layout of {} chunks",
            $idx,
            $count
        )
    };
}

// =============================================================================
// INV-ABI-02: Single-step transitions only
// =============================================================================

/// Assert a state transition follows the 0->1->2->3->0 cycle.
macro_rules! debug_assert_transition_legal {
    ($from:expr, $to:expr) => {
        debug_assert!(
            $from.can_transition_to($to),
            "INV-ABI-02 violated: transition {:?} -> {:?} is not on the ownership cycle",
            $from,
            $to
        )
    };
}

// =============================================================================
// INV-ABI-03: Region arithmetic stays inside the mapping
// =============================================================================

/// Assert a byte range lies inside the shared region.
macro_rules! debug_assert_in_region {
    ($offset:expr, $len:expr, $total:expr) => {
        debug_assert!(
            $offset + $len <= $total,
            "INV-ABI-03 violated: range {}..{} outside region of {} bytes",
            $offset,
            $offset + $len,
            $total
        )
    };
}

pub(crate) use debug_assert_chunk_in_layout;
pub(crate) use debug_assert_in_region;
pub(crate) use debug_assert_transition_legal;
