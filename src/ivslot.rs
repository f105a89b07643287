//! Steganographic codec for the 16-byte per-sector IV slot.
//!
//! Every public sector owns one integrity tag, and this design repurposes
//! the tag as an IV slot. A slot either looks like a random IV (never a
//! carrier, or a freed one) or carries a piece of a hidden sector: the head
//! slot of a carrier run holds six payload bytes plus the hidden logical
//! sector and sequence number; each tail slot holds ten payload bytes and
//! repeats the sequence. The magic byte and the public-write counter sit at
//! fixed tail positions in both forms so a public overwrite can freshen the
//! effective IV without disturbing hidden payload.

use crate::config::{
    CARRIERS_PER_HIDDEN, CHAIN_CONFIRM_TAILS, COUNTER_POS, HEAD_PAYLOAD, HIDDEN_MAGIC,
    IV_OFFSET_POS, IV_SIZE, LOGICAL_LEN, MAGIC_POS, SEQUENCE_LEN, TAIL_PAYLOAD, TREE_MAGIC,
};

/// A raw, decrypted IV slot.
pub type Slot = [u8; IV_SIZE];

/// Decoded head slot (`iv_offset == 0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadSlot {
    pub payload: [u8; HEAD_PAYLOAD],
    pub logical: u32,
    pub sequence: u16,
    pub counter: u16,
}

/// Decoded tail slot (`iv_offset` in `1..CARRIERS_PER_HIDDEN`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailSlot {
    pub payload: [u8; TAIL_PAYLOAD],
    pub sequence: u16,
    pub offset: u8,
    pub counter: u16,
}

/// What a decrypted slot turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotView {
    /// No recognized magic, or a malformed offset: either never a carrier
    /// or one that was freed and randomized.
    Random,
    /// Hidden-payload carrier at offset 0 of its run.
    Head(HeadSlot),
    /// Hidden-payload carrier at offset 1..N-1 of its run.
    Tail(TailSlot),
    /// Slot belongs to a persistent B+ tree node.
    Node,
}

/// Pack a head slot.
pub fn pack_head(payload: &[u8; HEAD_PAYLOAD], logical: u32, sequence: u16, counter: u16) -> Slot {
    let mut slot = [0u8; IV_SIZE];
    slot[..HEAD_PAYLOAD].copy_from_slice(payload);
    slot[HEAD_PAYLOAD..HEAD_PAYLOAD + LOGICAL_LEN].copy_from_slice(&logical.to_le_bytes());
    slot[HEAD_PAYLOAD + LOGICAL_LEN..HEAD_PAYLOAD + LOGICAL_LEN + SEQUENCE_LEN]
        .copy_from_slice(&sequence.to_le_bytes());
    slot[IV_OFFSET_POS] = 0;
    slot[COUNTER_POS..COUNTER_POS + 2].copy_from_slice(&counter.to_le_bytes());
    slot[MAGIC_POS] = HIDDEN_MAGIC;
    slot
}

/// Pack a tail slot at `offset` (must be in `1..CARRIERS_PER_HIDDEN`).
pub fn pack_tail(payload: &[u8; TAIL_PAYLOAD], sequence: u16, offset: u8, counter: u16) -> Slot {
    debug_assert!((1..CARRIERS_PER_HIDDEN as u8).contains(&offset));
    let mut slot = [0u8; IV_SIZE];
    slot[..TAIL_PAYLOAD].copy_from_slice(payload);
    slot[TAIL_PAYLOAD..TAIL_PAYLOAD + SEQUENCE_LEN].copy_from_slice(&sequence.to_le_bytes());
    slot[IV_OFFSET_POS] = offset;
    slot[COUNTER_POS..COUNTER_POS + 2].copy_from_slice(&counter.to_le_bytes());
    slot[MAGIC_POS] = HIDDEN_MAGIC;
    slot
}

/// Decode a slot. Unknown magic or an out-of-range offset classifies as
/// [`SlotView::Random`].
pub fn parse(slot: &Slot) -> SlotView {
    match slot[MAGIC_POS] {
        TREE_MAGIC => SlotView::Node,
        HIDDEN_MAGIC => {
            let offset = slot[IV_OFFSET_POS];
            if offset as usize >= CARRIERS_PER_HIDDEN {
                return SlotView::Random;
            }
            if offset == 0 {
                SlotView::Head(HeadSlot {
                    payload: slot[..HEAD_PAYLOAD].try_into().unwrap_or([0; HEAD_PAYLOAD]),
                    logical: u32::from_le_bytes(
                        slot[HEAD_PAYLOAD..HEAD_PAYLOAD + LOGICAL_LEN]
                            .try_into()
                            .unwrap_or([0; LOGICAL_LEN]),
                    ),
                    sequence: sequence_of(slot, HEAD_PAYLOAD + LOGICAL_LEN),
                    counter: counter_of(slot),
                })
            } else {
                SlotView::Tail(TailSlot {
                    payload: slot[..TAIL_PAYLOAD].try_into().unwrap_or([0; TAIL_PAYLOAD]),
                    sequence: sequence_of(slot, TAIL_PAYLOAD),
                    offset,
                    counter: counter_of(slot),
                })
            }
        }
        _ => SlotView::Random,
    }
}

fn sequence_of(slot: &Slot, at: usize) -> u16 {
    u16::from_le_bytes([slot[at], slot[at + 1]])
}

/// Read the public-write counter without decoding the rest of the slot.
pub fn counter_of(slot: &Slot) -> u16 {
    u16::from_le_bytes([slot[COUNTER_POS], slot[COUNTER_POS + 1]])
}

/// Bump the public-write counter in place, wrapping at 2^16. Payload bytes
/// are untouched, which is the whole point of the counter field.
pub fn bump_counter(slot: &mut Slot) -> u16 {
    let next = counter_of(slot).wrapping_add(1);
    slot[COUNTER_POS..COUNTER_POS + 2].copy_from_slice(&next.to_le_bytes());
    next
}

/// Carrier sector holding the head slot of the run that `sector` belongs
/// to, given the offset decoded from `sector`'s slot. `None` when the
/// offset under-runs the device (the slot is then treated as random).
pub fn head_sector(sector: u64, offset: u8) -> Option<u64> {
    sector.checked_sub(offset as u64)
}

/// Validation used at recovery time: a head and its first
/// [`CHAIN_CONFIRM_TAILS`] tails must all carry the hidden magic,
/// ascending offsets, and one shared public counter. A chain that cannot
/// produce this confirmation is a false positive and must be discarded.
pub fn confirm_chain(head: &Slot, tails: &[Slot]) -> bool {
    let h = match parse(head) {
        SlotView::Head(h) => h,
        _ => return false,
    };
    if tails.len() < CHAIN_CONFIRM_TAILS {
        return false;
    }
    tails[..CHAIN_CONFIRM_TAILS]
        .iter()
        .enumerate()
        .all(|(i, slot)| match parse(slot) {
            SlotView::Tail(tail) => tail.offset as usize == i + 1 && tail.counter == h.counter,
            _ => false,
        })
}

/// Split a 512-byte hidden sector into per-slot payload chunks: six bytes
/// for the head, ten for each tail. The final tail is zero-padded.
pub fn split_payload(plaintext: &[u8]) -> Vec<Vec<u8>> {
    debug_assert_eq!(plaintext.len(), crate::config::SECTOR_SIZE);
    let mut chunks = Vec::with_capacity(CARRIERS_PER_HIDDEN);
    chunks.push(plaintext[..HEAD_PAYLOAD].to_vec());
    let mut at = HEAD_PAYLOAD;
    for _ in 1..CARRIERS_PER_HIDDEN {
        let end = (at + TAIL_PAYLOAD).min(plaintext.len());
        let mut chunk = plaintext[at..end].to_vec();
        chunk.resize(TAIL_PAYLOAD, 0);
        chunks.push(chunk);
        at = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SECTOR_SIZE;

    #[test]
    fn head_round_trip() {
        let payload = [1, 2, 3, 4, 5, 6];
        let slot = pack_head(&payload, 0xDEAD_BEEF, 7, 3);
        match parse(&slot) {
            SlotView::Head(h) => {
                assert_eq!(h.payload, payload);
                assert_eq!(h.logical, 0xDEAD_BEEF);
                assert_eq!(h.sequence, 7);
                assert_eq!(h.counter, 3);
            }
            other => panic!("expected head, got {other:?}"),
        }
    }

    #[test]
    fn tail_round_trip_at_last_offset() {
        let payload = [9u8; TAIL_PAYLOAD];
        let offset = (CARRIERS_PER_HIDDEN - 1) as u8;
        let slot = pack_tail(&payload, 512, offset, 0);
        match parse(&slot) {
            SlotView::Tail(t) => {
                assert_eq!(t.payload, payload);
                assert_eq!(t.sequence, 512);
                assert_eq!(t.offset, offset);
            }
            other => panic!("expected tail, got {other:?}"),
        }
    }

    #[test]
    fn unknown_magic_is_random() {
        let slot = [0u8; IV_SIZE];
        assert_eq!(parse(&slot), SlotView::Random);
    }

    #[test]
    fn out_of_range_offset_is_random() {
        let mut slot = pack_tail(&[0u8; TAIL_PAYLOAD], 1, 1, 0);
        slot[IV_OFFSET_POS] = CARRIERS_PER_HIDDEN as u8;
        assert_eq!(parse(&slot), SlotView::Random);
    }

    #[test]
    fn head_resolution_handles_the_boundaries() {
        assert_eq!(head_sector(0, 0), Some(0));
        assert_eq!(head_sector(100, 51), Some(49));
        assert_eq!(head_sector(5, 10), None);
    }

    #[test]
    fn tree_magic_is_node() {
        let mut slot = [0u8; IV_SIZE];
        slot[MAGIC_POS] = TREE_MAGIC;
        assert_eq!(parse(&slot), SlotView::Node);
    }

    #[test]
    fn counter_bump_leaves_payload_untouched() {
        let mut slot = pack_head(&[0xAB; HEAD_PAYLOAD], 5, 1, u16::MAX);
        let before = slot;
        assert_eq!(bump_counter(&mut slot), 0); // wraps
        assert_eq!(&slot[..HEAD_PAYLOAD], &before[..HEAD_PAYLOAD]);
        assert_eq!(slot[MAGIC_POS], before[MAGIC_POS]);
        assert_eq!(counter_of(&slot), 0);
    }

    #[test]
    fn chain_confirmation_requires_matching_counters() {
        let head = pack_head(&[0; HEAD_PAYLOAD], 10, 2, 5);
        let t1 = pack_tail(&[0; TAIL_PAYLOAD], 2, 1, 5);
        let t2 = pack_tail(&[0; TAIL_PAYLOAD], 2, 2, 5);
        assert!(confirm_chain(&head, &[t1, t2]));

        let bad = pack_tail(&[0; TAIL_PAYLOAD], 2, 2, 6);
        assert!(!confirm_chain(&head, &[t1, bad]));

        let wrong_offset = pack_tail(&[0; TAIL_PAYLOAD], 2, 3, 5);
        assert!(!confirm_chain(&head, &[t1, wrong_offset]));
    }

    #[test]
    fn chain_confirmation_needs_enough_tails() {
        let head = pack_head(&[0; HEAD_PAYLOAD], 10, 2, 5);
        let short: Vec<Slot> = (1..CHAIN_CONFIRM_TAILS as u8)
            .map(|k| pack_tail(&[0; TAIL_PAYLOAD], 2, k, 5))
            .collect();
        assert!(!confirm_chain(&head, &short));
    }

    #[test]
    fn payload_split_covers_whole_sector() {
        let data: Vec<u8> = (0..SECTOR_SIZE as u32).map(|i| (i % 251) as u8).collect();
        let chunks = split_payload(&data);
        assert_eq!(chunks.len(), CARRIERS_PER_HIDDEN);
        assert_eq!(chunks[0].len(), HEAD_PAYLOAD);
        for chunk in &chunks[1..] {
            assert_eq!(chunk.len(), TAIL_PAYLOAD);
        }
        let mut rebuilt: Vec<u8> = chunks.concat();
        rebuilt.truncate(SECTOR_SIZE);
        assert_eq!(rebuilt, data);
    }
}
