//! Property-based tests for the shared-memory ABI.
//!
//! Coverage:
//! - chunk header codec: decode . encode == identity for all legal headers
//! - chunk state machine: only the 0->1->2->3->0 cycle is admitted,
//!   whatever operation sequence is attempted
//! - geometry: chunk ranges tile the page without overlap

use chunkring::{
    ChunkFlags, ChunkHeader, ChunkState, PageLayout, Smb, SmbConfig, CHUNK_HEADER_LEN,
};
use proptest::prelude::*;
use std::sync::Arc;

fn arb_layout() -> impl Strategy<Value = PageLayout> {
    prop::sample::select(PageLayout::ALL.to_vec())
}

fn arb_header() -> impl Strategy<Value = ChunkHeader> {
    (any::<u16>(), any::<u32>(), any::<u16>(), 0u8..4, any::<u16>()).prop_map(
        |(writer_id, chunk_id, packet_count, flag_bits, target_buffer)| ChunkHeader {
            writer_id,
            chunk_id,
            packet_count,
            flags: ChunkFlags::from_bits(flag_bits),
            target_buffer,
        },
    )
}

proptest! {
    /// decode(encode(h)) == h for every legal header.
    #[test]
    fn prop_header_codec_round_trips(header in arb_header()) {
        let raw = header.encode();
        prop_assert_eq!(ChunkHeader::decode(&raw), header);
        // Reserved tail is zero on encode.
        prop_assert_eq!(&raw[12..16], &[0, 0, 0, 0]);
    }

    /// The producer-id stamp never disturbs the decoded fields.
    #[test]
    fn prop_producer_stamp_is_orthogonal(header in arb_header(), producer in any::<u32>()) {
        let mut raw = header.encode();
        ChunkHeader::encode_producer_id(&mut raw, producer);
        prop_assert_eq!(ChunkHeader::decode(&raw), header);
        prop_assert_eq!(ChunkHeader::decode_producer_id(&raw), producer);
    }

    /// Chunks of a stamped page tile the page: disjoint, in-order,
    /// header + payload == chunk size.
    #[test]
    fn prop_chunks_tile_the_page(layout in arb_layout(), page_bits in 12u32..=15) {
        let page_size = 1usize << page_bits;
        let chunk_size = layout.chunk_size(page_size);
        prop_assert_eq!(layout.payload_size(page_size) + CHUNK_HEADER_LEN, chunk_size);
        prop_assert!(chunk_size * layout.chunk_count() <= page_size);
        // The unused remainder only exists for the non-power-of-two splits.
        if layout.chunk_count().is_power_of_two() {
            prop_assert_eq!(chunk_size * layout.chunk_count(), page_size);
        }
    }

    /// Whatever sequence of operations is attempted against a single
    /// chunk, the observed state only ever steps through the ownership
    /// cycle, and each operation succeeds exactly when the cycle allows.
    #[test]
    fn prop_state_machine_admits_only_the_cycle(
        layout in arb_layout(),
        ops in prop::collection::vec(0u8..4, 1..64),
    ) {
        let smb = Arc::new(Smb::in_process(SmbConfig::new(4096, 1).unwrap()));
        prop_assert!(smb.try_acquire_page(0, layout));

        // Model state for chunk 0; the guards below must agree with it.
        let mut model = ChunkState::Free;
        let mut writer_chunk = None;
        let mut service_chunk = None;

        for op in ops {
            match op {
                // try_acquire_chunk
                0 => {
                    let got = smb.try_acquire_chunk(0, 0);
                    prop_assert_eq!(got.is_some(), model == ChunkState::Free);
                    if let Some(c) = got {
                        writer_chunk = Some(c);
                        model = ChunkState::WriterOwned;
                    }
                }
                // complete
                1 => {
                    if let Some(c) = writer_chunk.take() {
                        prop_assert!(c.complete().is_ok());
                        model = ChunkState::Complete;
                    }
                }
                // try_begin_read
                2 => {
                    let got = smb.try_begin_read(0, 0);
                    prop_assert_eq!(got.is_some(), model == ChunkState::Complete);
                    if let Some(c) = got {
                        service_chunk = Some(c);
                        model = ChunkState::ServiceOwned;
                    }
                }
                // release
                _ => {
                    if let Some(c) = service_chunk.take() {
                        prop_assert!(c.release().is_ok());
                        model = ChunkState::Free;
                    }
                }
            }
            prop_assert_eq!(smb.snapshot_page(0).chunk_state(0), model);
        }
    }
}
