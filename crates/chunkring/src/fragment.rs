//! Record fragments inside a chunk payload.
//!
//! A chunk payload is a sequence of fragments, each a u32-le length prefix
//! followed by that many bytes. A record that fits its chunk is one
//! fragment; a record that spans chunks contributes one fragment per chunk,
//! stitched back together by the continuation flags in the chunk headers.
//!
//! The writer closes the stream with a terminator prefix (0xFFFF_FFFF,
//! never a legal length) when at least four payload bytes remain; otherwise
//! the payload end is the boundary. A fragment prefix therefore never
//! splits across chunks: writers seal a chunk early rather than start a
//! fragment in fewer than [`MIN_FRAGMENT_HEADROOM`] free bytes.

use thiserror::Error;

/// Bytes of the per-fragment length prefix.
pub const FRAGMENT_PREFIX_LEN: usize = 4;

/// Sentinel prefix marking the end of the fragment stream.
pub const FRAGMENT_TERMINATOR: u32 = u32::MAX;

/// Minimum free payload bytes required to open a new fragment: the prefix
/// plus one byte of content.
pub const MIN_FRAGMENT_HEADROOM: usize = FRAGMENT_PREFIX_LEN + 1;

/// A fragment stream that does not parse. Fatal to the producer connection
/// that committed the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FragmentError {
    /// A length prefix claims more bytes than the payload holds.
    #[error("fragment length {claimed} overruns payload ({remaining} bytes remain)")]
    Overrun { claimed: usize, remaining: usize },
}

/// Splits a chunk payload into its fragments, in write order.
pub fn parse_fragments(payload: &[u8]) -> Result<Vec<&[u8]>, FragmentError> {
    let mut fragments = Vec::new();
    let mut pos = 0;
    while pos + FRAGMENT_PREFIX_LEN <= payload.len() {
        let prefix = u32::from_le_bytes(
            payload[pos..pos + FRAGMENT_PREFIX_LEN]
                .try_into()
                .expect("prefix slice is 4 bytes"),
        );
        if prefix == FRAGMENT_TERMINATOR {
            break;
        }
        let len = prefix as usize;
        let start = pos + FRAGMENT_PREFIX_LEN;
        let remaining = payload.len() - start;
        if len > remaining {
            return Err(FragmentError::Overrun {
                claimed: len,
                remaining,
            });
        }
        fragments.push(&payload[start..start + len]);
        pos = start + len;
    }
    Ok(fragments)
}
