//! chunkring-writer - Producer-side record writer runtime
//!
//! Data sources write records through [`RecordWriter`]s; the runtime hides
//! chunk acquisition, fragmentation across chunks and pages, loss
//! accounting under backpressure, and commit signaling toward the service.
//! One [`Arbiter`] per shared memory buffer coordinates the process's
//! writers; writers themselves are strictly single-threaded.
//!
//! # Example
//!
//! ```
//! use chunkring::{PageLayout, Smb, SmbConfig};
//! use chunkring_writer::{Arbiter, NullListener, StallPolicy};
//! use std::sync::Arc;
//!
//! let smb = Arc::new(Smb::in_process(SmbConfig::default()));
//! let arbiter = Arbiter::new(smb, PageLayout::Four, Arc::new(NullListener));
//! let mut writer = arbiter.create_writer(0, StallPolicy::Drop).unwrap();
//!
//! let mut record = writer.begin_record();
//! record.append(b"hello trace").unwrap();
//! record.finalize().unwrap();
//!
//! // Nothing is visible to the service until the chunk fills or flushes.
//! writer.flush().unwrap();
//! assert_eq!(writer.stats().chunks_committed, 1);
//! ```

mod arbiter;
mod backoff;
mod writer;

pub use arbiter::{Arbiter, CommitListener, NullListener};
pub use writer::{RecordGuard, RecordWriter, StallPolicy, WriterStats};

use chunkring::AbiError;
use thiserror::Error;

/// Errors surfaced by the writer runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriterError {
    /// The stall deadline elapsed with no chunk available; the in-flight
    /// record fell back to Drop semantics.
    #[error("stall deadline elapsed waiting for a free chunk")]
    StallTimeout,

    /// Every writer id of this SMB is in use.
    #[error("all writer ids are in use")]
    TooManyWriters,

    /// The ABI reported a protocol violation; the SMB is unusable.
    #[error(transparent)]
    Abi(#[from] AbiError),
}

impl WriterError {
    /// True for conditions the caller can ride out (losses are already
    /// counted); false when the SMB itself is broken.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::StallTimeout)
    }
}
