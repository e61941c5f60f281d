//! The 16-byte chunk header: the cross-process compatibility contract.
//!
//! Byte layout (little-endian, offsets within the chunk):
//!
//! ```text
//! 0..2    writer_id      u16   never 0 for a committed chunk
//! 2..6    chunk_id       u32   per-writer, strictly increasing
//! 6..8    packet_count   u16   complete records fully inside this chunk
//! 8       flags          u8    continuation bits, see ChunkFlags
//! 9       reserved       u8    zero
//! 10..12  target_buffer  u16   destination central buffer id
//! 12..16  reserved       u32   zero in the SMB; the service stamps the
//!                              producer id here when copying the chunk
//!                              into a central buffer slot
//! ```
//!
//! The encoding is hand-rolled rather than derived: this is an ABI shared
//! with foreign writers, so the byte positions are load-bearing.

use crate::layout::CHUNK_HEADER_LEN;

/// Writer identifier, unique within one SMB. 0 is never a valid writer.
pub type WriterId = u16;

/// Central buffer identifier within a session.
pub type BufferId = u16;

/// Producer identifier, assigned by the service per connection.
pub type ProducerId = u32;

/// Continuation flags for a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ChunkFlags(u8);

impl ChunkFlags {
    const CONTINUES_FROM_PREV: u8 = 1 << 0;
    const CONTINUES_INTO_NEXT: u8 = 1 << 1;
    /// Reserved for payload transforms; must be zero on the wire today.
    const TRANSFORMED: u8 = 1 << 2;

    /// No continuation on either side.
    #[inline]
    pub fn none() -> ChunkFlags {
        ChunkFlags(0)
    }

    /// The first fragment in this chunk continues a record begun in the
    /// previous chunk of the same writer sequence.
    #[inline]
    pub fn continues_from_prev(self) -> bool {
        self.0 & Self::CONTINUES_FROM_PREV != 0
    }

    /// The last fragment in this chunk continues into the next chunk of
    /// the same writer sequence.
    #[inline]
    pub fn continues_into_next(self) -> bool {
        self.0 & Self::CONTINUES_INTO_NEXT != 0
    }

    #[inline]
    pub fn set_continues_from_prev(&mut self) {
        self.0 |= Self::CONTINUES_FROM_PREV;
    }

    #[inline]
    pub fn set_continues_into_next(&mut self) {
        self.0 |= Self::CONTINUES_INTO_NEXT;
    }

    /// True if any bit outside the defined set is up, or the reserved
    /// transform bit is up. Such a header fails validation at ingestion.
    #[inline]
    pub fn has_reserved_bits(self) -> bool {
        self.0 & !(Self::CONTINUES_FROM_PREV | Self::CONTINUES_INTO_NEXT) != 0
            || self.0 & Self::TRANSFORMED != 0
    }

    /// Raw bits, for encoding.
    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Rebuilds flags from raw bits. Reserved bits are preserved so that
    /// validation can reject them with the exact offending value.
    #[inline]
    pub fn from_bits(bits: u8) -> ChunkFlags {
        ChunkFlags(bits)
    }
}

/// Decoded form of the 16-byte chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub writer_id: WriterId,
    pub chunk_id: u32,
    pub packet_count: u16,
    pub flags: ChunkFlags,
    pub target_buffer: BufferId,
}

impl ChunkHeader {
    /// Encodes into the on-wire 16-byte form. Reserved bytes are zeroed.
    pub fn encode(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut out = [0u8; CHUNK_HEADER_LEN];
        out[0..2].copy_from_slice(&self.writer_id.to_le_bytes());
        out[2..6].copy_from_slice(&self.chunk_id.to_le_bytes());
        out[6..8].copy_from_slice(&self.packet_count.to_le_bytes());
        out[8] = self.flags.bits();
        out[10..12].copy_from_slice(&self.target_buffer.to_le_bytes());
        out
    }

    /// Decodes the on-wire form. Never fails: validation of field values
    /// (nonzero writer, reserved flag bits) happens at ingestion where the
    /// error can be attributed to a producer connection.
    pub fn decode(raw: &[u8; CHUNK_HEADER_LEN]) -> ChunkHeader {
        ChunkHeader {
            writer_id: u16::from_le_bytes([raw[0], raw[1]]),
            chunk_id: u32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]]),
            packet_count: u16::from_le_bytes([raw[6], raw[7]]),
            flags: ChunkFlags::from_bits(raw[8]),
            target_buffer: u16::from_le_bytes([raw[10], raw[11]]),
        }
    }

    /// Reads the producer id the service stamped into the reserved tail of
    /// a central-buffer slot preface. Zero inside an SMB.
    pub fn decode_producer_id(raw: &[u8; CHUNK_HEADER_LEN]) -> ProducerId {
        u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]])
    }

    /// Stamps the producer id into the reserved tail of an encoded header.
    /// Only the service does this, on its private copy of the chunk.
    pub fn encode_producer_id(raw: &mut [u8; CHUNK_HEADER_LEN], producer: ProducerId) {
        raw[12..16].copy_from_slice(&producer.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_positions_are_stable() {
        let mut flags = ChunkFlags::none();
        flags.set_continues_into_next();
        let header = ChunkHeader {
            writer_id: 0x0102,
            chunk_id: 0x0304_0506,
            packet_count: 0x0708,
            flags,
            target_buffer: 0x090A,
        };
        let raw = header.encode();
        assert_eq!(raw[0..2], [0x02, 0x01]);
        assert_eq!(raw[2..6], [0x06, 0x05, 0x04, 0x03]);
        assert_eq!(raw[6..8], [0x08, 0x07]);
        assert_eq!(raw[8], 0b10);
        assert_eq!(raw[9], 0);
        assert_eq!(raw[10..12], [0x0A, 0x09]);
        assert_eq!(raw[12..16], [0, 0, 0, 0]);
    }

    #[test]
    fn decode_inverts_encode() {
        let mut flags = ChunkFlags::none();
        flags.set_continues_from_prev();
        let header = ChunkHeader {
            writer_id: 7,
            chunk_id: u32::MAX,
            packet_count: 3,
            flags,
            target_buffer: 1,
        };
        assert_eq!(ChunkHeader::decode(&header.encode()), header);
    }

    #[test]
    fn producer_id_round_trips_through_reserved_tail() {
        let header = ChunkHeader {
            writer_id: 1,
            chunk_id: 1,
            packet_count: 0,
            flags: ChunkFlags::none(),
            target_buffer: 0,
        };
        let mut raw = header.encode();
        ChunkHeader::encode_producer_id(&mut raw, 0xDEAD_BEEF);
        assert_eq!(ChunkHeader::decode_producer_id(&raw), 0xDEAD_BEEF);
        // Stamping the tail does not disturb the decoded fields.
        assert_eq!(ChunkHeader::decode(&raw), header);
    }

    #[test]
    fn reserved_flag_bits_are_flagged() {
        assert!(!ChunkFlags::from_bits(0b11).has_reserved_bits());
        assert!(ChunkFlags::from_bits(0b100).has_reserved_bits());
        assert!(ChunkFlags::from_bits(0b1000).has_reserved_bits());
    }
}
