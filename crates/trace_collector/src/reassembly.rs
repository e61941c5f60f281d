//! Per-sequence record reassembly.
//!
//! Fragments of a spanning record arrive as the trailing/leading fragments
//! of consecutive chunks of one writer sequence. Reassembly is lazy: bytes
//! concatenate only when the read cursor walks the slots, and a record is
//! emitted exactly when its final fragment (a chunk whose
//! continues-into-next flag is clear) is reached with an unbroken chain of
//! predecessors behind it.
//!
//! Loss accounting is necessarily approximate around gaps: when an eviction
//! or a discarded chunk swallows part of a chain, the dropped pending
//! record and an orphan continuation arriving right after it are counted as
//! one broken record, and further orphan pieces of the same run are
//! discarded silently (`skipping`).

use crate::records::{Record, RecordKind};
use chunkring::{ChunkFlags, ProducerId, WriterId};

/// Read-side state for one `(producer, writer)` sequence.
#[derive(Debug, Default)]
pub(crate) struct SequenceState {
    /// Chunk id of the last slot the reader consumed for this sequence.
    last_chunk_id: Option<u32>,
    /// Accumulated bytes of a record whose tail has not arrived yet.
    pending: Option<Vec<u8>>,
    /// Inside a broken record: discard its continuation fragments without
    /// further counting.
    skipping: bool,
    /// An unread chunk of this sequence was evicted; the next slot the
    /// reader visits is across a gap whatever its chunk id says.
    gap_pending: bool,
}

impl SequenceState {
    /// Records that an unread chunk of this sequence was evicted before
    /// the reader reached it.
    pub(crate) fn mark_gap(&mut self) {
        self.gap_pending = true;
    }
}

/// Effects of consuming one slot.
#[derive(Debug, Default)]
pub(crate) struct SlotOutcome {
    pub records: Vec<Record>,
    pub records_lost: u64,
    pub gaps: u64,
}

impl SequenceState {
    /// Consumes one slot's fragments, in write order.
    pub(crate) fn consume_slot(
        &mut self,
        producer_id: ProducerId,
        writer_id: WriterId,
        chunk_id: u32,
        flags: ChunkFlags,
        fragments: &[&[u8]],
    ) -> SlotOutcome {
        let mut out = SlotOutcome::default();
        let contiguous = !self.gap_pending
            && self.last_chunk_id.is_some_and(|l| chunk_id == l.wrapping_add(1));
        if (self.last_chunk_id.is_some() || self.gap_pending) && !contiguous {
            out.gaps += 1;
        }
        self.gap_pending = false;
        self.last_chunk_id = Some(chunk_id);

        let emit = |payload: Vec<u8>, out: &mut SlotOutcome| {
            out.records.push(Record {
                producer_id,
                writer_id,
                kind: RecordKind::Data,
                payload,
            });
        };

        if fragments.is_empty() {
            // A chunk with no fragments cannot continue a record; any
            // pending chain is broken.
            if self.pending.take().is_some() {
                out.records_lost += 1;
            }
            return out;
        }

        let count = fragments.len();
        for (i, frag) in fragments.iter().enumerate() {
            let continues_prev = i == 0 && flags.continues_from_prev();
            let continues_next = i == count - 1 && flags.continues_into_next();

            if continues_prev {
                if contiguous && self.pending.is_some() {
                    let pending = self.pending.as_mut().expect("checked above");
                    pending.extend_from_slice(frag);
                    if !continues_next {
                        emit(self.pending.take().expect("checked above"), &mut out);
                    }
                } else {
                    // The head of this record is gone (evicted, discarded,
                    // or never committed). Count the broken record once.
                    let had_pending = self.pending.take().is_some();
                    if had_pending || !self.skipping {
                        out.records_lost += 1;
                    }
                    self.skipping = continues_next;
                }
                continue;
            }

            if i == 0 {
                // A fresh fragment: any pending chain was truncated by its
                // writer (stall fallback or crash).
                if self.pending.take().is_some() {
                    out.records_lost += 1;
                }
                self.skipping = false;
            }

            if continues_next {
                self.pending = Some(frag.to_vec());
            } else {
                emit(frag.to_vec(), &mut out);
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(prev: bool, next: bool) -> ChunkFlags {
        let mut f = ChunkFlags::none();
        if prev {
            f.set_continues_from_prev();
        }
        if next {
            f.set_continues_into_next();
        }
        f
    }

    fn payloads(out: &SlotOutcome) -> Vec<Vec<u8>> {
        out.records.iter().map(|r| r.payload.clone()).collect()
    }

    #[test]
    fn whole_records_pass_through() {
        let mut st = SequenceState::default();
        let out = st.consume_slot(1, 1, 1, flags(false, false), &[b"a".as_slice(), b"bb"]);
        assert_eq!(payloads(&out), vec![b"a".to_vec(), b"bb".to_vec()]);
        assert_eq!(out.records_lost, 0);
    }

    #[test]
    fn three_chunk_record_reassembles() {
        let mut st = SequenceState::default();
        let o1 = st.consume_slot(1, 1, 1, flags(false, true), &[b"aa".as_slice()]);
        assert!(o1.records.is_empty());
        let o2 = st.consume_slot(1, 1, 2, flags(true, true), &[b"bb".as_slice()]);
        assert!(o2.records.is_empty());
        let o3 = st.consume_slot(1, 1, 3, flags(true, false), &[b"cc".as_slice()]);
        assert_eq!(payloads(&o3), vec![b"aabbcc".to_vec()]);
        assert_eq!(o3.records_lost + o2.records_lost + o1.records_lost, 0);
    }

    #[test]
    fn spanning_record_with_neighbors_in_the_same_chunks() {
        let mut st = SequenceState::default();
        // chunk 1: [whole "x"][head of spanning record]
        let o1 = st.consume_slot(1, 1, 1, flags(false, true), &[b"x".as_slice(), b"span-"]);
        assert_eq!(payloads(&o1), vec![b"x".to_vec()]);
        // chunk 2: [tail of spanning record][whole "y"]
        let o2 = st.consume_slot(1, 1, 2, flags(true, false), &[b"tail".as_slice(), b"y"]);
        assert_eq!(payloads(&o2), vec![b"span-tail".to_vec(), b"y".to_vec()]);
    }

    #[test]
    fn gap_drops_pending_and_counts_once() {
        let mut st = SequenceState::default();
        st.consume_slot(1, 1, 1, flags(false, true), &[b"head".as_slice()]);
        // chunk 2 evicted; chunk 3 carries the record's further middle.
        let out = st.consume_slot(1, 1, 3, flags(true, true), &[b"mid".as_slice()]);
        assert!(out.records.is_empty());
        assert_eq!(out.records_lost, 1);
        assert_eq!(out.gaps, 1);
        // chunk 4 ends the broken record: discarded silently.
        let out = st.consume_slot(1, 1, 4, flags(true, false), &[b"end".as_slice(), b"fresh"]);
        assert_eq!(out.records_lost, 0);
        assert_eq!(payloads(&out), vec![b"fresh".to_vec()]);
    }

    #[test]
    fn orphan_tail_without_any_pending_counts_once() {
        let mut st = SequenceState::default();
        // First thing ever seen is the middle of some record.
        let out = st.consume_slot(1, 1, 5, flags(true, true), &[b"mid".as_slice()]);
        assert_eq!(out.records_lost, 1);
        let out = st.consume_slot(1, 1, 6, flags(true, false), &[b"end".as_slice()]);
        assert_eq!(out.records_lost, 0);
        assert!(out.records.is_empty());
    }

    #[test]
    fn writer_truncation_is_detected() {
        let mut st = SequenceState::default();
        st.consume_slot(1, 1, 1, flags(false, true), &[b"head".as_slice()]);
        // Contiguous chunk that does NOT continue: the writer dropped the
        // record's tail under backpressure.
        let out = st.consume_slot(1, 1, 2, flags(false, false), &[b"fresh".as_slice()]);
        assert_eq!(out.records_lost, 1);
        assert_eq!(out.gaps, 0);
        assert_eq!(payloads(&out), vec![b"fresh".to_vec()]);
    }

    #[test]
    fn empty_chunk_breaks_a_chain() {
        let mut st = SequenceState::default();
        st.consume_slot(1, 1, 1, flags(false, true), &[b"head".as_slice()]);
        let out = st.consume_slot(1, 1, 2, flags(false, false), &[]);
        assert_eq!(out.records_lost, 1);
    }
}
